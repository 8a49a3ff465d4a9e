// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Persistence integration tests: session rows + tick time-series.
//!
//! Run with: `cargo test`

use floodwatch::config::DefaultParams;
use floodwatch::db::{Db, SessionMeta, TickRow};
use floodwatch::params::Params;

fn meta<'a>(camera_id: &'a str) -> SessionMeta<'a> {
    SessionMeta {
        camera_id,
        camera_name: "Test camera",
        location: "test bench",
        source_type: "video",
        source_url: "/video/test.mp4",
    }
}

fn tick(ts_ms: i64, video_sec: f64, pct: i64) -> TickRow {
    TickRow {
        ts_ms,
        video_sec,
        water_percent: pct,
        risk_level: 2,
        mask_h: 360,
        mask_w: 640,
        water_polys: Some(r#"[{"outer":[[0.1,0.1],[0.5,0.1],[0.5,0.5]],"holes":[]}]"#.into()),
        risk_boxes: Some("[[0.1,0.1,0.2,0.2,3]]".into()),
    }
}

#[tokio::test]
async fn session_lifecycle_roundtrip() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let params = Params::from_defaults(&DefaultParams::default());

    let id = db.create_session(&meta("cam1"), &params).await.expect("create");
    assert!(id > 0);
    assert_eq!(db.session_status(id).await.unwrap().as_deref(), Some("running"));

    db.update_record_path(id, "records/cam1/20260801_120000.mp4").await.expect("path");
    db.finish_session(id, "done").await.expect("finish");

    let sessions = db.list_sessions(Some("cam1"), 10).await.expect("list");
    assert_eq!(sessions.len(), 1);
    let s = &sessions[0];
    assert_eq!(s.id, id);
    assert_eq!(s.status, "done");
    assert_eq!(s.record_path.as_deref(), Some("records/cam1/20260801_120000.mp4"));
    assert!(s.started_at.is_some());
    assert!(s.ended_at.is_some());
}

#[tokio::test]
async fn ticks_read_back_ordered_by_time() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let params = Params::from_defaults(&DefaultParams::default());
    let id = db.create_session(&meta("cam1"), &params).await.expect("create");

    // Insert out of order; the read side orders by (video_sec, ts_ms).
    db.save_tick(id, &tick(2000, 2.0, 30)).await.expect("t2");
    db.save_tick(id, &tick(0, 0.0, 10)).await.expect("t0");
    db.save_tick(id, &tick(1000, 1.0, 20)).await.expect("t1");

    let rows = db.list_ticks(id, 0).await.expect("list");
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows.iter().map(|r| r.water_percent).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
    assert!(rows[0].water_polys.as_deref().unwrap().contains("outer"));
    assert!(rows[0].risk_boxes.as_deref().unwrap().contains("3"));

    let limited = db.list_ticks(id, 2).await.expect("limited");
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn sessions_filter_by_camera() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let params = Params::from_defaults(&DefaultParams::default());

    db.create_session(&meta("cam1"), &params).await.expect("a");
    db.create_session(&meta("cam2"), &params).await.expect("b");
    db.create_session(&meta("cam1"), &params).await.expect("c");

    assert_eq!(db.list_sessions(Some("cam1"), 10).await.unwrap().len(), 2);
    assert_eq!(db.list_sessions(Some("cam2"), 10).await.unwrap().len(), 1);
    assert_eq!(db.list_sessions(None, 10).await.unwrap().len(), 3);
    assert_eq!(db.list_sessions(None, 2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn delete_removes_session_and_ticks() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let params = Params::from_defaults(&DefaultParams::default());
    let id = db.create_session(&meta("cam1"), &params).await.expect("create");
    db.save_tick(id, &tick(0, 0.0, 5)).await.expect("tick");
    db.save_tick(id, &tick(100, 0.1, 6)).await.expect("tick");

    assert!(db.delete_session(id).await.expect("delete"));
    assert!(db.list_ticks(id, 0).await.expect("ticks").is_empty());
    assert!(db.list_sessions(Some("cam1"), 10).await.expect("sessions").is_empty());

    // Unknown ids report not-found.
    assert!(!db.delete_session(9999).await.expect("missing"));
}

#[tokio::test]
async fn terminal_status_values_are_stored_verbatim() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let params = Params::from_defaults(&DefaultParams::default());

    for status in ["done", "stopped", "error"] {
        let id = db.create_session(&meta("cam1"), &params).await.expect("create");
        db.finish_session(id, status).await.expect("finish");
        assert_eq!(db.session_status(id).await.unwrap().as_deref(), Some(status));
    }
}
