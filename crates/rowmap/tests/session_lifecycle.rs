mod common;

use common::{JPA, SPRING_BOOT, name_of, school};
use rowmap::prelude::*;
use rowmap::{Fault, OpKind, StateErrorKind, StoreErrorKind, StoreOp};
use std::sync::Arc;

fn new_course(session: &Session, name: &str) -> EntityRef {
    session
        .new_entity("Course")
        .expect("registered type")
        .with("name", name)
        .expect("name column")
        .into_ref()
}

#[test]
fn saved_course_is_visible_to_a_later_session() {
    let db = school();
    let mut session = db.factory.open();
    let course = new_course(&session, "MS in 50 Steps");

    session.save(&course).expect("save");
    assert!(entity_id(&course).is_none());
    assert_eq!(db.store.counts().writes(), 0);

    let summary = session.commit().expect("commit");
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.total(), 1);
    assert_eq!(session.phase(), SessionPhase::Committed);

    let id = entity_id(&course).expect("key assigned at commit");
    assert_eq!(id, EntityId(SPRING_BOOT.get() + 1));

    let session = db.factory.open();
    let found = session.find("Course", id).expect("find").expect("course stored");
    assert_eq!(name_of(&found), "MS in 50 Steps");
}

#[test]
fn insert_then_edit_flushes_one_insert_with_latest_values() {
    let db = school();
    let mut session = db.factory.open();
    let course = new_course(&session, "Draft");
    session.save(&course).expect("save");

    write_entity(&course).set("name", "Final").expect("set name");
    session.save(&course).expect("save again");
    assert_eq!(session.pending_counts().total(), 1);

    let summary = session.commit().expect("commit");
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(db.store.counts().insert, 1);
    assert_eq!(db.store.counts().update, 0);

    let id = entity_id(&course).expect("key assigned");
    let raw = db.store.raw_row("CourseDetails", id).expect("row stored");
    assert_eq!(raw.get("courseName"), Some(&Value::from("Final")));
}

#[test]
fn inserts_are_stamped_and_start_undeleted() {
    let db = school();
    let mut session = db.factory.open();
    let course = new_course(&session, "Timestamps in 5 Steps");
    session.save(&course).expect("save");
    session.commit().expect("commit");

    let id = entity_id(&course).expect("key assigned");
    let raw = db.store.raw_row("CourseDetails", id).expect("row stored");
    assert!(matches!(raw.get("created_date"), Some(Value::Timestamp(_))));
    assert!(matches!(raw.get("last_updated_date"), Some(Value::Timestamp(_))));
    assert_eq!(raw.get("is_deleted"), Some(&Value::Bool(false)));
}

#[test]
fn edits_to_managed_instances_are_detected_at_commit() {
    let db = school();
    let mut session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");
    let untouched = session.find("Course", SPRING_BOOT).expect("find").expect("course exists");

    write_entity(&course)
        .set("name", "JPA in 50 Steps - Updated")
        .expect("set name");
    let summary = session.commit().expect("commit");

    assert_eq!(summary.updated, 1);
    assert_eq!(db.store.counts().update, 1);
    let raw = db.store.raw_row("CourseDetails", JPA).expect("row stored");
    assert_eq!(raw.get("courseName"), Some(&Value::from("JPA in 50 Steps - Updated")));
    assert!(matches!(raw.get("last_updated_date"), Some(Value::Timestamp(_))));
    assert_eq!(name_of(&untouched), "Spring Boot in 100 Steps");
}

#[test]
fn explicit_dirty_marking_is_required_without_auto_check() {
    let mut db = school();
    db.factory = db.factory.with_config(SessionConfig::default().auto_dirty_check(false));

    let mut session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");
    write_entity(&course).set("name", "Ignored").expect("set name");
    assert_eq!(session.commit().expect("commit").updated, 0);

    let mut session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");
    write_entity(&course).set("name", "Kept").expect("set name");
    session.mark_dirty(&course).expect("managed instance");
    assert_eq!(session.commit().expect("commit").updated, 1);
    assert_eq!(
        db.store.raw_row("CourseDetails", JPA).expect("row").get("courseName"),
        Some(&Value::from("Kept"))
    );
}

#[test]
fn rollback_discards_pending_work_without_touching_the_store() {
    let db = school();
    let mut session = db.factory.open();
    let course = new_course(&session, "Never Stored");
    session.save(&course).expect("save");
    session.delete("Course", JPA).expect("delete");
    db.store.reset_counts();

    session.rollback().expect("rollback");

    assert_eq!(session.phase(), SessionPhase::RolledBack);
    assert_eq!(db.store.counts().writes(), 0);
    assert_eq!(db.store.row_count("CourseDetails"), 3);
    assert!(matches!(
        session.find("Course", JPA),
        Err(Error::SessionClosed(SessionPhase::RolledBack))
    ));
}

#[test]
fn rollback_after_saving_two_new_courses_inserts_nothing() {
    let db = school();
    let mut session = db.factory.open();
    let first = new_course(&session, "Rollback in 10 Steps");
    let second = new_course(&session, "Rollback in 20 Steps");
    session.save(&first).expect("save");
    session.save(&second).expect("save");
    assert_eq!(session.pending_counts().inserts, 2);

    session.rollback().expect("rollback");

    assert_eq!(db.store.counts().insert, 0);
    assert_eq!(db.store.row_count("CourseDetails"), 3);
    assert!(entity_id(&first).is_none());
    assert!(entity_id(&second).is_none());
}

#[test]
fn dropping_an_open_session_writes_nothing() {
    let db = school();
    {
        let mut session = db.factory.open();
        let course = new_course(&session, "Dropped");
        session.save(&course).expect("save");
    }
    assert_eq!(db.store.counts().writes(), 0);
    assert_eq!(db.store.row_count("CourseDetails"), 3);
}

#[test]
fn saving_a_detached_copy_merges_into_the_managed_instance() {
    let db = school();
    let detached = {
        let session = db.factory.open();
        session.find("Course", JPA).expect("find").expect("course exists")
    };
    write_entity(&detached).set("name", "Merged Name").expect("set name");

    let mut session = db.factory.open();
    let managed = session.save(&detached).expect("merge");

    assert!(!Arc::ptr_eq(&managed, &detached));
    assert!(session.contains(&managed));
    assert_eq!(name_of(&managed), "Merged Name");

    let summary = session.commit().expect("commit");
    assert_eq!(summary.updated, 1);
    assert_eq!(
        db.store.raw_row("CourseDetails", JPA).expect("row").get("courseName"),
        Some(&Value::from("Merged Name"))
    );
}

#[test]
fn removing_a_detached_instance_is_rejected() {
    let db = school();
    let detached = {
        let session = db.factory.open();
        session.find("Course", JPA).expect("find").expect("course exists")
    };
    let mut session = db.factory.open();
    let err = session.remove(&detached).unwrap_err();
    assert!(matches!(err, Error::State(ref e) if e.kind == StateErrorKind::NotTracked));
    assert!(session.is_open());
}

#[test]
fn failed_flush_reports_applied_writes_and_fails_the_session() {
    let db = school();
    db.store
        .inject(Fault::on(StoreOp::Insert).table("ReviewDetails").kind(StoreErrorKind::Unavailable));

    let mut session = db.factory.open();
    let course = new_course(&session, "Fault Tolerance in 3 Steps");
    let review = session
        .new_entity("Review")
        .expect("registered type")
        .with("rating", "5")
        .expect("rating column")
        .into_ref();
    review.set_one("course", Some(&course)).expect("set course");
    course.add_to("reviews", &review).expect("add review");
    session.save(&course).expect("save");

    let err = session.commit().unwrap_err();

    assert_eq!(err.store_kind(), Some(StoreErrorKind::Unavailable));
    assert!(err.is_retryable());
    let Error::Flush(flush) = &err else {
        panic!("expected a flush error, got {err}");
    };
    assert_eq!(flush.applied.len(), 1);
    assert_eq!(flush.applied[0].kind, OpKind::Insert);
    assert_eq!(flush.applied[0].entity, "Course");
    assert_eq!(flush.failed.entity, "Review");

    assert_eq!(session.phase(), SessionPhase::Failed);
    assert_eq!(db.store.row_count("CourseDetails"), 4);
    assert_eq!(db.store.row_count("ReviewDetails"), 2);
    assert!(matches!(
        session.find("Course", JPA),
        Err(Error::SessionClosed(SessionPhase::Failed))
    ));
}

#[test]
fn unsaved_reference_without_cascade_keeps_the_session_open() {
    let db = school();
    let mut session = db.factory.open();
    let course = new_course(&session, "Orphan Course");
    let review = session
        .new_entity("Review")
        .expect("registered type")
        .with("rating", "3")
        .expect("rating column")
        .into_ref();
    review.set_one("course", Some(&course)).expect("set course");
    session.save(&review).expect("save review");

    let err = session.commit().unwrap_err();
    assert!(matches!(err, Error::State(ref e) if e.kind == StateErrorKind::TransientReference));
    assert!(session.is_open());
    assert_eq!(db.store.counts().writes(), 0);

    session.save(&course).expect("save course");
    let summary = session.commit().expect("commit");
    assert_eq!(summary.inserted, 2);
    let course_id = entity_id(&course).expect("course key");
    let review_id = entity_id(&review).expect("review key");
    assert_eq!(
        db.store.raw_row("ReviewDetails", review_id).expect("row").get("course_id"),
        Some(&Value::from(course_id))
    );
}

#[test]
fn flush_summary_serializes_for_reporting() {
    let db = school();
    let mut session = db.factory.open();
    session.delete("Course", JPA).expect("delete");
    let summary = session.commit().expect("commit");

    let json = serde_json::to_value(summary).expect("serialize");
    assert_eq!(json["soft_deleted"], 1);
    assert_eq!(json["deleted"], 2);
    assert_eq!(json["cascaded"], 2);
}
