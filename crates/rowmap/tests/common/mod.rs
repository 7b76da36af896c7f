//! School fixture schema shared by the integration tests.
#![allow(dead_code)]

use rowmap::prelude::*;
use rowmap::InMemory;

pub const STUDENT_COURSE: LinkTableInfo =
    LinkTableInfo::new("STUDENT_COURSE", "STUDENT_ID", "COURSE_ID");

/// The same link table seen from the course side.
pub const COURSE_STUDENT: LinkTableInfo =
    LinkTableInfo::new("STUDENT_COURSE", "COURSE_ID", "STUDENT_ID");

pub static COURSE: EntityType = EntityType::new("Course", "CourseDetails")
    .columns(&[
        ColumnInfo::new("name", "courseName", SqlType::Text).nullable(false),
        ColumnInfo::new("created_date", "created_date", SqlType::Timestamp),
        ColumnInfo::new("last_updated_date", "last_updated_date", SqlType::Timestamp),
        ColumnInfo::new("is_deleted", "is_deleted", SqlType::Bool),
    ])
    .relationships(&[
        RelationshipInfo::new("reviews", "Review", RelationshipKind::OneToMany)
            .remote_key("course_id")
            .cascade(CascadePolicy::SaveAndDelete),
        RelationshipInfo::new("students", "Student", RelationshipKind::ManyToMany)
            .link_table(COURSE_STUDENT)
            .mapped_by("courses"),
    ])
    .soft_delete("is_deleted")
    .created_timestamp("created_date")
    .updated_timestamp("last_updated_date")
    .cacheable(true);

pub static REVIEW: EntityType = EntityType::new("Review", "ReviewDetails")
    .columns(&[
        ColumnInfo::new("description", "descriptionReview", SqlType::Text),
        ColumnInfo::new("rating", "rating", SqlType::Text).nullable(false),
    ])
    .relationships(&[
        RelationshipInfo::new("course", "Course", RelationshipKind::ManyToOne).local_key("course_id"),
    ]);

pub static STUDENT: EntityType = EntityType::new("Student", "StudentDetails")
    .columns(&[
        ColumnInfo::new("first_name", "studentFirstName", SqlType::Text).nullable(false),
        ColumnInfo::new("last_name", "studentLastName", SqlType::Text).nullable(false),
    ])
    .relationships(&[
        RelationshipInfo::new("passport", "Passport", RelationshipKind::OneToOne)
            .local_key("passport_id")
            .cascade(CascadePolicy::Save),
        RelationshipInfo::new("courses", "Course", RelationshipKind::ManyToMany)
            .link_table(STUDENT_COURSE),
    ]);

pub static PASSPORT: EntityType = EntityType::new("Passport", "PassportDetails")
    .columns(&[ColumnInfo::new("number", "passportNumber", SqlType::Text).nullable(false)])
    .relationships(&[
        RelationshipInfo::new("student", "Student", RelationshipKind::OneToOne)
            .remote_key("passport_id"),
    ]);

pub const JPA: EntityId = EntityId(10001);
pub const SPRING: EntityId = EntityId(10002);
pub const SPRING_BOOT: EntityId = EntityId(10003);
pub const RANGA: EntityId = EntityId(20001);
pub const ADAM: EntityId = EntityId(20002);
pub const E123456: EntityId = EntityId(30001);
pub const N123457: EntityId = EntityId(30002);
pub const GREAT_COURSE: EntityId = EntityId(50001);
pub const WONDERFUL_COURSE: EntityId = EntityId(50002);

pub fn schema() -> Schema {
    Schema::builder()
        .register(&COURSE)
        .register(&REVIEW)
        .register(&STUDENT)
        .register(&PASSPORT)
        .build()
        .expect("school schema is valid")
}

/// A seeded school database with a second-level cache attached.
pub fn school() -> InMemory {
    school_with(SessionConfig::default())
}

pub fn school_with(config: SessionConfig) -> InMemory {
    let mut db = rowmap::in_memory(schema(), Some(CacheConfig::default()));
    db.factory = db.factory.with_config(config);
    seed(&db.store);
    db
}

fn seed(store: &MemoryStore) {
    for (id, name) in [
        (JPA, "JPA in 50 Steps"),
        (SPRING, "Spring in 50 Steps"),
        (SPRING_BOOT, "Spring Boot in 100 Steps"),
    ] {
        store.seed(
            &COURSE,
            Row::from_pairs([
                ("id", Value::from(id)),
                ("courseName", Value::from(name)),
                ("is_deleted", Value::Bool(false)),
            ]),
        );
    }
    for (id, number) in [(E123456, "E123456"), (N123457, "N123457")] {
        store.seed(
            &PASSPORT,
            Row::from_pairs([("id", Value::from(id)), ("passportNumber", Value::from(number))]),
        );
    }
    for (id, first, passport) in [(RANGA, "Ranga", E123456), (ADAM, "Adam", N123457)] {
        store.seed(
            &STUDENT,
            Row::from_pairs([
                ("id", Value::from(id)),
                ("studentFirstName", Value::from(first)),
                ("studentLastName", Value::from("Smith")),
                ("passport_id", Value::from(passport)),
            ]),
        );
    }
    for (id, rating, description) in [
        (GREAT_COURSE, "5", "Great Course"),
        (WONDERFUL_COURSE, "4", "Wonderful Course"),
    ] {
        store.seed(
            &REVIEW,
            Row::from_pairs([
                ("id", Value::from(id)),
                ("rating", Value::from(rating)),
                ("descriptionReview", Value::from(description)),
                ("course_id", Value::from(JPA)),
            ]),
        );
    }
    store.seed_link(&STUDENT_COURSE, RANGA, JPA);
    store.seed_link(&STUDENT_COURSE, ADAM, JPA);
    store.seed_link(&STUDENT_COURSE, RANGA, SPRING);
    store.reset_counts();
}

pub fn name_of(entity: &EntityRef) -> String {
    read_entity(entity).get_as::<String>("name").expect("course name")
}
