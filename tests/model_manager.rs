mod common;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use cgmath::{Matrix3, Rad, Vector3};
use serde_json::json;

use common::{assert_matrix_close, assert_vector_close, identity, Dataset, MemoryStrategy};
use pose_editor::{DataKinds, ErrorKind, JsonStrategy, ManagerEvent, ManagerState, ModelManager};

fn json_manager(dataset: &Dataset) -> ModelManager {
    let mut manager = ModelManager::new(Box::new(JsonStrategy::new(&dataset.settings)));
    manager.reload();
    manager
}

fn memory_manager(strategy: &MemoryStrategy) -> ModelManager {
    let mut manager = ModelManager::new(Box::new(strategy.clone()));
    manager.reload();
    manager
}

fn assert_indices_consistent(manager: &ModelManager) {
    for image in manager.images() {
        let indexed: HashSet<_> = manager.poses_for_image(image).iter().map(|p| p.id().to_string()).collect();
        let scanned: HashSet<_> = manager
            .poses()
            .iter()
            .filter(|p| Arc::ptr_eq(p.image(), image))
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(indexed, scanned, "index for image {}", image.id);
    }
    for model in manager.object_models() {
        let indexed: HashSet<_> = manager
            .poses_for_object_model(model)
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        let scanned: HashSet<_> = manager
            .poses()
            .iter()
            .filter(|p| Arc::ptr_eq(p.object_model(), model))
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(indexed, scanned, "index for object model {}", model.id);
    }
}

#[test]
fn test_loaded_poses_reference_cached_entities() {
    let dataset = Dataset::new(&["0001.png", "0002.png"], &[("model1", "obj_01.ply")]);
    let identity_r = [1, 0, 0, 0, 1, 0, 0, 0, 1];
    dataset.write_poses(&json!({
        "0001.png": [
            { "id": "ok", "R": identity_r, "t": [0, 0, 500], "obj": "obj_01.ply" },
            { "id": "no_model", "R": identity_r, "t": [0, 0, 500], "obj": "obj_99.ply" }
        ],
        "0009.png": [
            { "id": "no_image", "R": identity_r, "t": [0, 0, 500], "obj": "obj_01.ply" }
        ]
    }));

    let manager = json_manager(&dataset);

    assert_eq!(manager.poses().len(), 1);
    for pose in manager.poses() {
        assert!(manager.images().iter().any(|i| Arc::ptr_eq(i, pose.image())));
        assert!(manager.object_models().iter().any(|m| Arc::ptr_eq(m, pose.object_model())));
    }
    assert!(manager.pose_by_id("no_image").is_none());
    assert!(manager.pose_by_id("no_model").is_none());
    assert_eq!(manager.state(), ManagerState::Ready);
}

#[test]
fn test_ids_stay_unique_across_mutations() {
    let strategy = MemoryStrategy::with_entities(&["0001.png", "0002.png"], &["obj_01.ply", "obj_02.ply"]);
    let mut manager = memory_manager(&strategy);
    let image = manager.images()[0].clone();
    let other_image = manager.images()[1].clone();
    let model = manager.object_models()[0].clone();
    let other_model = manager.object_models()[1].clone();
    let position = Vector3::new(0.0, 0.0, 500.0);

    let first = manager.add_pose(&image, &model, position, identity()).unwrap();
    let second = manager.add_pose(&image, &model, position, identity()).unwrap();
    manager.add_pose(&image, &other_model, position, identity()).unwrap();
    manager.add_pose(&other_image, &model, position, identity()).unwrap();
    manager.remove_pose(&first).unwrap();
    let third = manager.add_pose(&image, &model, position, identity()).unwrap();
    manager.update_pose(&second, Vector3::new(1.0, 2.0, 3.0), identity()).unwrap();

    assert_eq!(second, "0001_obj_01_2");
    // The freed base id is reused
    assert_eq!(third, "0001_obj_01");

    let ids: Vec<_> = manager.poses().iter().map(|p| p.id().to_string()).collect();
    let unique: HashSet<_> = ids.iter().cloned().collect();
    assert_eq!(ids.len(), unique.len());
    assert_eq!(ids.len(), 4);
    assert_indices_consistent(&manager);

    let on_image = manager.poses_for(&image, &model);
    assert_eq!(on_image.len(), 2);
}

#[test]
fn test_indices_follow_removals() {
    let strategy = MemoryStrategy::with_entities(&["0001.png", "0002.png"], &["obj_01.ply"]);
    let mut manager = memory_manager(&strategy);
    let model = manager.object_models()[0].clone();

    let mut ids = Vec::new();
    for image in manager.images().to_vec() {
        ids.push(manager.add_pose(&image, &model, Vector3::new(0.0, 0.0, 1.0), identity()).unwrap());
    }
    manager.remove_pose(&ids[0]).unwrap();

    assert_indices_consistent(&manager);
    assert!(manager.poses_for_image(&manager.images()[0]).is_empty());
    assert_eq!(manager.poses_for_object_model(&model).len(), 1);
    assert_eq!(strategy.stored_ids(), vec![ids[1].clone()]);
}

#[test]
fn test_round_trip_through_poses_file() {
    let dataset = Dataset::new(&["0001.png"], &[("model1", "obj_01.ply")]);
    let mut manager = json_manager(&dataset);
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();

    let rotation = Matrix3::from_angle_x(Rad(0.4)) * Matrix3::from_angle_z(Rad(-1.1));
    let position = Vector3::new(12.5, -3.25, 640.0);
    let id = manager.add_pose(&image, &model, position, rotation).unwrap();

    let reloaded = json_manager(&dataset);
    let pose = reloaded.pose_by_id(&id).unwrap();
    assert_vector_close(pose.position(), position, 1e-9);
    assert_matrix_close(&pose.rotation_matrix(), &rotation, 1e-9);
    assert_eq!(pose.object_model().id, "model1/obj_01.ply");

    let document = dataset.read_poses();
    assert_eq!(document["0001.png"][0]["id"], id.as_str());
    assert_eq!(document["0001.png"][0]["obj"], "obj_01.ply");
}

#[test]
fn test_failed_writes_roll_back() {
    let strategy = MemoryStrategy::with_entities(&["0001.png"], &["obj_01.ply"]);
    let mut manager = memory_manager(&strategy);
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();

    let rotation = Matrix3::from_angle_y(Rad(0.7));
    let position = Vector3::new(1.0, 2.0, 300.0);
    let id = manager.add_pose(&image, &model, position, rotation).unwrap();
    let before = manager.pose_by_id(&id).unwrap().clone();

    strategy.fail_writes(true);
    let mut events = manager.subscribe();

    let err = manager
        .update_pose(&id, Vector3::new(9.0, 9.0, 9.0), identity())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
    let after = manager.pose_by_id(&id).unwrap();
    assert_eq!(after.position(), before.position());
    assert_eq!(after.rotation(), before.rotation());

    let err = manager.add_pose(&image, &model, position, rotation).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
    assert_eq!(manager.poses().len(), 1);

    let err = manager.remove_pose(&id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
    assert_eq!(manager.poses().len(), 1);
    assert_indices_consistent(&manager);

    // Failures are reported, never announced as changes
    let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(received.len(), 3);
    assert!(received
        .iter()
        .all(|e| matches!(e, ManagerEvent::Error { kind: ErrorKind::PersistenceFailed, .. })));
    assert_eq!(strategy.stored_ids(), vec![id]);
}

#[test]
fn test_failed_json_write_keeps_file_and_cache() {
    let dataset = Dataset::new(&["0001.png"], &[("model1", "obj_01.ply")]);
    let mut manager = json_manager(&dataset);
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();

    fs::remove_file(&dataset.settings.poses_file_path).unwrap();
    let err = manager
        .add_pose(&image, &model, Vector3::new(0.0, 0.0, 1.0), identity())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
    assert!(manager.poses().is_empty());
    assert!(!dataset.settings.poses_file_path.exists());
}

#[test]
fn test_successful_mutations_publish_events() {
    let strategy = MemoryStrategy::with_entities(&["0001.png"], &["obj_01.ply"]);
    let mut manager = memory_manager(&strategy);
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();
    let mut events = manager.subscribe();

    let id = manager.add_pose(&image, &model, Vector3::new(0.0, 0.0, 1.0), identity()).unwrap();
    manager.update_pose(&id, Vector3::new(0.0, 0.0, 2.0), identity()).unwrap();
    manager.remove_pose(&id).unwrap();

    let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        received,
        vec![
            ManagerEvent::PoseAdded { id: id.clone() },
            ManagerEvent::PoseUpdated { id: id.clone() },
            ManagerEvent::PoseDeleted { id },
        ]
    );
}

#[test]
fn test_object_models_in_numeric_order() {
    let dataset = Dataset::new(
        &["0001.png"],
        &[("model10", "obj_10.ply"), ("model2", "obj_02.ply"), ("model1", "obj_01.ply")],
    );
    let manager = json_manager(&dataset);

    let ids: Vec<_> = manager.object_models().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["model1/obj_01.ply", "model2/obj_02.ply", "model10/obj_10.ply"]);
}

#[test]
fn test_invalid_entities_are_listed() {
    let dataset = Dataset::new(&["0001.png", "0002.png"], &[("model1", "obj_01.ply")]);
    common::write_json(
        &dataset.settings.images_path.join("info.json"),
        &json!({ "0001.png": { "K": common::K }, "0002.png": { "K": "oops" } }),
    );
    dataset.write_poses(&json!({
        "0001.png": [ { "id": "broken", "t": [0, 0, 1], "obj": "obj_01.ply" } ]
    }));

    let manager = json_manager(&dataset);

    assert_eq!(manager.images().len(), 1);
    assert_eq!(manager.invalid_images().len(), 1);
    assert_eq!(manager.invalid_images()[0].name, "0002.png");
    assert_eq!(manager.invalid_poses().len(), 1);
    assert!(manager.poses().is_empty());
}

#[test]
fn test_external_edit_triggers_reload() {
    let dataset = Dataset::new(&["0001.png"], &[("model1", "obj_01.ply")]);
    let mut manager = json_manager(&dataset);
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();
    manager.add_pose(&image, &model, Vector3::new(0.0, 0.0, 1.0), identity()).unwrap();

    // Our own write is not an external change
    assert!(manager.poll_external_changes().is_empty());

    dataset.write_poses(&json!({}));
    let mut events = manager.subscribe();
    let changed = manager.poll_external_changes();

    assert_eq!(changed, DataKinds::POSES);
    assert!(manager.poses().is_empty());
    let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(received.contains(&ManagerEvent::DataChanged(DataKinds::POSES)));
    assert_eq!(received.last(), Some(&ManagerEvent::StateChanged(ManagerState::Ready)));
}

#[test]
fn test_missing_paths_leave_manager_in_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let settings = pose_editor::Settings::for_dataset(dir.path());
    let mut manager = ModelManager::new(Box::new(JsonStrategy::new(&settings)));
    let mut events = manager.subscribe();
    manager.reload();

    assert_eq!(manager.state(), ManagerState::Error(ErrorKind::PathNotFound));
    let errors = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, ManagerEvent::Error { .. }))
        .count();
    assert_eq!(errors, 3);
}

#[test]
fn test_added_pose_leaves_skipped_entries_alone() {
    let dataset = Dataset::new(&["0001.png"], &[("model1", "obj_01.ply")]);
    dataset.write_poses(&json!({
        "0001.png": [
            { "id": "0001_obj_01", "R": [1, 0, 0, 0, 1, 0, 0, 0, 1], "t": [1, 2, 3], "obj": "obj_99.ply" }
        ]
    }));
    let mut manager = json_manager(&dataset);
    assert!(manager.poses().is_empty());
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();

    let id = manager
        .add_pose(&image, &model, Vector3::new(0.0, 0.0, 500.0), identity())
        .unwrap();
    assert_eq!(id, "0001_obj_01_2");

    let document = dataset.read_poses();
    let entries = document["0001.png"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], "0001_obj_01");
    assert_eq!(entries[0]["obj"], "obj_99.ply");
    assert_eq!(entries[0]["t"], json!([1, 2, 3]));
    assert_eq!(entries[1]["id"], id.as_str());
}

#[test]
fn test_external_edit_before_own_write_reaches_cache() {
    let dataset = Dataset::new(&["0001.png", "0002.png"], &[("model1", "obj_01.ply")]);
    let mut manager = json_manager(&dataset);
    let image = manager.images()[0].clone();
    let model = manager.object_models()[0].clone();

    dataset.write_poses(&json!({
        "0002.png": [
            { "id": "ext", "R": [1, 0, 0, 0, 1, 0, 0, 0, 1], "t": [0, 0, 500], "obj": "obj_01.ply" }
        ]
    }));
    let id = manager
        .add_pose(&image, &model, Vector3::new(0.0, 0.0, 1.0), identity())
        .unwrap();

    assert_eq!(manager.poll_external_changes(), DataKinds::POSES);
    assert!(manager.pose_by_id("ext").is_some());
    assert!(manager.pose_by_id(&id).is_some());
    assert_indices_consistent(&manager);
    assert!(manager.poll_external_changes().is_empty());
}
