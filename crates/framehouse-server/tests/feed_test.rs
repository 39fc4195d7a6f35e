//! Synthetic feed into a real storage manager

use framehouse_server::SyntheticCamera;
use framehouse_storage::{Signal, StorageConfig, StorageManager, VideoRequest, VideoResult};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn test_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        root_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_01_feed_populates_every_rate() {
    let dir = TempDir::new().unwrap();
    let manager = StorageManager::open(test_config(&dir)).await.unwrap();
    let mut camera = SyntheticCamera::new(4.0, 0).unwrap().with_frame_bytes(64);

    // 20 frames at 30fps
    for i in 0..20 {
        for record in camera.frame(i * 33_333).unwrap() {
            manager.add_nal(record).await.unwrap();
        }
    }
    manager.flush().await.unwrap();

    assert_eq!(manager.rates().await, vec![1, 4, 16]);
    let ranges = manager.get_ranges(1).await;
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].frame_count, 20);
    assert_eq!(manager.get_ranges(4).await[0].frame_count, 5);
    assert_eq!(manager.get_next_add_seq_num().await, 26);

    let result = manager
        .get_video(&VideoRequest::new(1, 0, 5), &Signal::new())
        .await
        .unwrap();
    let VideoResult::Video(video) = result else {
        panic!("expected video, got {:?}", result);
    };
    // Keyframes every 10 frames
    assert_eq!(video.frames.len(), 10);
    assert_eq!(video.next_key_frame_time, Some(10 * 33_333));
}

#[tokio::test]
async fn test_02_run_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(StorageManager::open(test_config(&dir)).await.unwrap());
    let camera = SyntheticCamera::new(4.0, 0).unwrap().with_frame_bytes(64);

    let (stop_tx, stop_rx) = watch::channel(false);
    let feed = tokio::spawn(camera.run(manager.clone(), 200.0, stop_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), feed)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    manager.flush().await.unwrap();
    assert!(manager.rates().await.contains(&1));
    assert!(manager.get_next_add_seq_num().await > 0);
}
