//! Integration tests for approval compare-and-swap transitions and the
//! expiry sweep.

use uuid::Uuid;

use steward_db::models::ApprovalStatus;
use steward_db::queries::approvals::{self as db, CasOutcome, NewApproval};
use steward_test_utils::TestDb;

fn new_approval(id: Uuid) -> NewApproval {
    NewApproval {
        id,
        caller: "visitor".into(),
        target: "jarvis".into(),
        task: "delete logs".into(),
        label: None,
        project: Some("ops".into()),
        model: None,
        thinking_level: None,
        timeout_seconds: None,
        cleanup: "keep".into(),
        reason: Some("cleanup week".into()),
        ttl_days: 7.0,
        notification_message_id: Some(format!("msg-{id}")),
        notification_channel_id: Some("C-approvals".into()),
    }
}

#[tokio::test]
async fn cas_approve_paths() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();
    let id = Uuid::new_v4();
    db::insert_approval(&pool, &new_approval(id)).await.unwrap();

    // pending -> approved applies once.
    assert_eq!(
        db::cas_approve(&pool, id, "kevin").await.unwrap(),
        CasOutcome::Applied
    );
    assert_eq!(
        db::cas_approve(&pool, id, "kevin").await.unwrap(),
        CasOutcome::AlreadyInStatus(ApprovalStatus::Approved)
    );

    // approved_spawn_failed re-enters the approve path.
    assert_eq!(db::mark_spawn_failed(&pool, id).await.unwrap(), 1);
    assert_eq!(
        db::cas_approve(&pool, id, "kevin").await.unwrap(),
        CasOutcome::Applied
    );

    // Unknown ids are reported as missing.
    assert_eq!(
        db::cas_approve(&pool, Uuid::new_v4(), "kevin").await.unwrap(),
        CasOutcome::Missing
    );

    test_db.close().await;
}

#[tokio::test]
async fn cas_reject_only_from_pending() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();
    let id = Uuid::new_v4();
    db::insert_approval(&pool, &new_approval(id)).await.unwrap();

    assert_eq!(
        db::cas_reject(&pool, id, "kevin").await.unwrap(),
        CasOutcome::Applied
    );
    // Rejected is terminal for both verbs.
    assert_eq!(
        db::cas_reject(&pool, id, "kevin").await.unwrap(),
        CasOutcome::AlreadyInStatus(ApprovalStatus::Rejected)
    );
    assert_eq!(
        db::cas_approve(&pool, id, "kevin").await.unwrap(),
        CasOutcome::AlreadyInStatus(ApprovalStatus::Rejected)
    );

    test_db.close().await;
}

#[tokio::test]
async fn reverse_index_resolves_notification_message() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();
    let id = Uuid::new_v4();
    db::insert_approval(&pool, &new_approval(id)).await.unwrap();

    let found = db::find_by_notification_message(&pool, &format!("msg-{id}"))
        .await
        .unwrap()
        .expect("reverse index hit");
    assert_eq!(found.id, id);

    assert!(
        db::find_by_notification_message(&pool, "msg-unknown")
            .await
            .unwrap()
            .is_none()
    );

    test_db.close().await;
}

#[tokio::test]
async fn pending_listing_is_oldest_first_and_scoped() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    db::insert_approval(&pool, &new_approval(first)).await.unwrap();
    db::insert_approval(&pool, &new_approval(second)).await.unwrap();

    let pending = db::list_pending(&pool, 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first);

    // Only pending records appear.
    db::cas_reject(&pool, first, "kevin").await.unwrap();
    let pending = db::list_pending(&pool, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);

    let scoped = db::list_pending_for_project(&pool, "ops", 10).await.unwrap();
    assert_eq!(scoped.len(), 1);
    let scoped = db::list_pending_for_project(&pool, "elsewhere", 10).await.unwrap();
    assert!(scoped.is_empty());

    test_db.close().await;
}

#[tokio::test]
async fn expiry_sweep_marks_pending_records() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();
    let id = Uuid::new_v4();
    db::insert_approval(&pool, &new_approval(id)).await.unwrap();

    sqlx::query("UPDATE approvals SET expires_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(db::sweep_expired(&pool).await.unwrap(), 1);
    let record = db::get_approval(&pool, id).await.unwrap().unwrap();
    assert_eq!(record.status, ApprovalStatus::Expired);
    assert!(record.expired_at.is_some());

    // Expired records leave the pending set.
    assert!(db::list_pending(&pool, 10).await.unwrap().is_empty());

    test_db.close().await;
}

#[tokio::test]
async fn prefix_matching_is_scoped_to_actionable_records() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();
    let id = Uuid::new_v4();
    db::insert_approval(&pool, &new_approval(id)).await.unwrap();

    let prefix = &id.to_string()[..8];
    let matches = db::match_approval_prefix(&pool, prefix).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, id);

    // Terminal records stop matching.
    db::cas_reject(&pool, id, "kevin").await.unwrap();
    let matches = db::match_approval_prefix(&pool, prefix).await.unwrap();
    assert!(matches.is_empty());

    // Hostile input yields no matches rather than SQL weirdness.
    let matches = db::match_approval_prefix(&pool, "%' OR 1=1 --").await.unwrap();
    assert!(matches.is_empty());

    test_db.close().await;
}
