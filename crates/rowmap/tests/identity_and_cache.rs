mod common;

use common::{GREAT_COURSE, JPA, SPRING, name_of, school, school_with};
use rowmap::prelude::*;
use rowmap::{PutOutcome, WriteStatus};
use std::sync::{Arc, Mutex};

type Hook = Box<dyn FnOnce() + Send>;

/// Forwards to a memory store and runs `after_update` once, right after
/// the first UPDATE of row `target` has been applied.
struct InterleavingStore {
    inner: Arc<MemoryStore>,
    target: EntityId,
    after_update: Mutex<Option<Hook>>,
}

impl InterleavingStore {
    fn interleave(&self, id: EntityId) {
        if id != self.target {
            return;
        }
        let hook = self.after_update.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl RowStore for InterleavingStore {
    fn fetch_row(&self, entity: &EntityType, id: EntityId) -> Result<Option<Row>> {
        self.inner.fetch_row(entity, id)
    }

    fn fetch_many(&self, entity: &EntityType, column: &str, value: &Value) -> Result<Vec<Row>> {
        self.inner.fetch_many(entity, column, value)
    }

    fn insert(&self, entity: &EntityType, row: &Row) -> Result<EntityId> {
        self.inner.insert(entity, row)
    }

    fn update(&self, entity: &EntityType, id: EntityId, row: &Row) -> Result<WriteStatus> {
        let status = self.inner.update(entity, id, row)?;
        self.interleave(id);
        Ok(status)
    }

    fn update_unless(
        &self,
        entity: &EntityType,
        id: EntityId,
        row: &Row,
        column: &str,
        value: &Value,
    ) -> Result<WriteStatus> {
        let status = self.inner.update_unless(entity, id, row, column, value)?;
        self.interleave(id);
        Ok(status)
    }

    fn delete(&self, entity: &EntityType, id: EntityId) -> Result<WriteStatus> {
        self.inner.delete(entity, id)
    }

    fn fetch_links(&self, link: &LinkTableInfo, owner: EntityId) -> Result<Vec<EntityId>> {
        self.inner.fetch_links(link, owner)
    }

    fn insert_link(&self, link: &LinkTableInfo, owner: EntityId, target: EntityId) -> Result<()> {
        self.inner.insert_link(link, owner, target)
    }

    fn delete_link(
        &self,
        link: &LinkTableInfo,
        owner: EntityId,
        target: EntityId,
    ) -> Result<WriteStatus> {
        self.inner.delete_link(link, owner, target)
    }
}

#[test]
fn find_twice_in_one_session_returns_the_same_instance() {
    let db = school();
    let session = db.factory.open();

    let first = session.find("Course", JPA).expect("find").expect("course exists");
    let second = session.find("Course", JPA).expect("find").expect("course exists");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(db.store.counts().fetch_row, 1);
    assert_eq!(session.tracked_count(), 1);
}

#[test]
fn navigation_reuses_instances_already_in_the_identity_map() {
    let db = school();
    let session = db.factory.open();

    let course = session.find("Course", JPA).expect("find").expect("course exists");
    let review = session
        .find("Review", GREAT_COURSE)
        .expect("find")
        .expect("review exists");

    let owner = review.one("course").expect("load").expect("review has a course");
    assert!(Arc::ptr_eq(&owner, &course));

    let reviews = course.many("reviews").expect("load reviews");
    assert_eq!(reviews.len(), 2);
    assert!(reviews.iter().any(|r| Arc::ptr_eq(r, &review)));
}

#[test]
fn separate_sessions_get_separate_instances() {
    let db = school();
    let one = db.factory.open();
    let two = db.factory.open();

    let a = one.find("Course", JPA).expect("find").expect("course exists");
    let b = two.find("Course", JPA).expect("find").expect("course exists");

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(one.contains(&a));
    assert!(!one.contains(&b));
}

#[test]
fn second_session_reads_cacheable_rows_from_the_cache() {
    let db = school();
    let cache = db.cache.clone().expect("cache attached");

    {
        let session = db.factory.open();
        session.find("Course", JPA).expect("find").expect("course exists");
    }
    assert!(cache.contains("Course", JPA));

    let session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");

    assert_eq!(name_of(&course), "JPA in 50 Steps");
    assert_eq!(db.store.counts().fetch_row, 1);
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn non_cacheable_types_always_hit_the_store() {
    let db = school();
    for _ in 0..2 {
        let session = db.factory.open();
        session
            .find("Review", GREAT_COURSE)
            .expect("find")
            .expect("review exists");
    }
    assert_eq!(db.store.counts().fetch_row, 2);
    assert!(!db.cache.expect("cache attached").contains("Review", GREAT_COURSE));
}

#[test]
fn cache_can_be_bypassed_per_factory() {
    let db = school_with(SessionConfig::default().use_second_level_cache(false));
    for _ in 0..2 {
        let session = db.factory.open();
        session.find("Course", JPA).expect("find").expect("course exists");
    }
    assert_eq!(db.store.counts().fetch_row, 2);
}

#[test]
fn commit_refreshes_cached_rows() {
    let db = school();
    let cache = db.cache.clone().expect("cache attached");

    let mut session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");
    write_entity(&course)
        .set("name", "JPA in 50 Steps - Updated")
        .expect("set name");
    session.commit().expect("commit");

    let entry = cache.get("Course", JPA).expect("entry refreshed");
    assert_eq!(
        entry.row.get("courseName"),
        Some(&Value::from("JPA in 50 Steps - Updated"))
    );

    let session = db.factory.open();
    let reread = session.find("Course", JPA).expect("find").expect("course exists");
    assert_eq!(name_of(&reread), "JPA in 50 Steps - Updated");
    assert_eq!(db.store.counts().fetch_row, 1);
}

#[test]
fn late_reader_cannot_overwrite_a_committed_update() {
    let db = school();
    let cache = db.cache.clone().expect("cache attached");

    // A reader stamps its fetch, then a writer commits before the reader
    // gets round to populating the cache.
    let stamp = cache.next_version();
    let stale_row = db.store.raw_row("CourseDetails", JPA).expect("seeded row");

    let mut writer = db.factory.open();
    let course = writer.find("Course", JPA).expect("find").expect("course exists");
    write_entity(&course).set("name", "JPA in 100 Steps").expect("set name");
    writer.commit().expect("commit");

    assert_eq!(cache.put("Course", JPA, stale_row, stamp), PutOutcome::Stale);
    assert_eq!(cache.stats().stale_writes, 1);

    let session = db.factory.open();
    let reread = session.find("Course", JPA).expect("find").expect("course exists");
    assert_eq!(name_of(&reread), "JPA in 100 Steps");
}

#[test]
fn invalidate_on_commit_when_refresh_is_disabled() {
    let db = school_with(SessionConfig::default().refresh_cache_on_commit(false));
    let cache = db.cache.clone().expect("cache attached");

    let mut session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");
    write_entity(&course).set("name", "Renamed").expect("set name");
    session.commit().expect("commit");

    assert!(!cache.contains("Course", JPA));
    let session = db.factory.open();
    let reread = session.find("Course", JPA).expect("find").expect("course exists");
    assert_eq!(name_of(&reread), "Renamed");
    assert_eq!(db.store.counts().fetch_row, 2);
}

#[test]
fn cache_follows_the_last_committed_write() {
    let db = school();
    let cache = db.cache.clone().expect("cache attached");

    // Another session commits its own rename between our UPDATE reaching
    // the store and our commit refreshing the cache.
    let other = db.factory.clone();
    let rename: Hook = Box::new(move || {
        let mut session = other.open();
        let course = session.find("Course", SPRING).expect("find").expect("course exists");
        write_entity(&course).set("name", "B wrote last").expect("set name");
        session.commit().expect("commit");
    });
    let store = InterleavingStore {
        inner: Arc::clone(&db.store),
        target: SPRING,
        after_update: Mutex::new(Some(rename)),
    };
    let factory = SessionFactory::new(Arc::clone(db.factory.schema()), Arc::new(store))
        .with_cache(Arc::clone(&cache));

    let mut session = factory.open();
    let course = session.find("Course", SPRING).expect("find").expect("course exists");
    write_entity(&course).set("name", "A wrote first").expect("set name");
    assert_eq!(session.commit().expect("commit").updated, 1);

    let raw = db.store.raw_row("CourseDetails", SPRING).expect("row stored");
    assert_eq!(raw.get("courseName"), Some(&Value::from("B wrote last")));
    if let Some(entry) = cache.get("Course", SPRING) {
        assert_eq!(entry.row.get("courseName"), Some(&Value::from("B wrote last")));
    }

    let reader = db.factory.open();
    let reread = reader.find("Course", SPRING).expect("find").expect("course exists");
    assert_eq!(name_of(&reread), "B wrote last");
}
