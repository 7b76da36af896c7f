mod common;

use common::{ADAM, JPA, N123457, RANGA, SPRING, SPRING_BOOT, school};
use rowmap::prelude::*;
use rowmap::StoreOp;
use std::sync::Arc;

#[test]
fn student_with_new_passport_inserts_passport_first() {
    let db = school();
    let mut session = db.factory.open();

    let passport = session
        .new_entity("Passport")
        .expect("registered type")
        .with("number", "Z123456")
        .expect("number column")
        .into_ref();
    let student = session
        .new_entity("Student")
        .expect("registered type")
        .with("first_name", "Mike")
        .expect("first name")
        .with("last_name", "Jordan")
        .expect("last name")
        .into_ref();
    student.set_one("passport", Some(&passport)).expect("set passport");
    session.save(&student).expect("save");

    let summary = session.commit().expect("commit");
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.cascaded, 1);

    let tables: Vec<_> = db
        .store
        .journal()
        .into_iter()
        .filter(|entry| entry.op == StoreOp::Insert)
        .map(|entry| entry.table)
        .collect();
    assert_eq!(tables, ["PassportDetails", "StudentDetails"]);

    let passport_id = entity_id(&passport).expect("passport key");
    let student_id = entity_id(&student).expect("student key");
    assert_eq!(
        db.store.raw_row("StudentDetails", student_id).expect("row").get("passport_id"),
        Some(&Value::from(passport_id))
    );
}

#[test]
fn inverse_one_to_one_loads_the_owner() {
    let db = school();
    let session = db.factory.open();
    let passport = session.find("Passport", N123457).expect("find").expect("passport exists");
    let student = passport.one("student").expect("load").expect("passport has a student");
    assert_eq!(entity_id(&student), Some(ADAM));
    let back = student.one("passport").expect("load").expect("student has a passport");
    assert!(Arc::ptr_eq(&back, &passport));
}

#[test]
fn deleting_a_course_cascades_to_its_reviews() {
    let db = school();
    let mut session = db.factory.open();
    let course = session.find("Course", JPA).expect("find").expect("course exists");
    session.remove(&course).expect("remove");

    let summary = session.commit().expect("commit");

    assert_eq!(summary.soft_deleted, 1);
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.cascaded, 2);
    assert_eq!(db.store.row_count("ReviewDetails"), 0);
    assert_eq!(db.store.counts().delete, 2);
    // The soft-deleted course keeps its row and its enrolments.
    assert_eq!(db.store.row_count("CourseDetails"), 3);
    assert_eq!(db.store.link_count("STUDENT_COURSE"), 3);
}

#[test]
fn enrolling_from_the_owning_side_writes_a_link_row() {
    let db = school();
    let mut session = db.factory.open();
    let student = session.find("Student", RANGA).expect("find").expect("student exists");
    let course = session.find("Course", SPRING_BOOT).expect("find").expect("course exists");

    student.add_to("courses", &course).expect("enrol");
    let summary = session.commit().expect("commit");

    assert_eq!(summary.linked, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(db.store.link_count("STUDENT_COURSE"), 4);

    let session = db.factory.open();
    let course = session.find("Course", SPRING_BOOT).expect("find").expect("course exists");
    let students = course.many("students").expect("load students");
    assert_eq!(students.len(), 1);
    assert_eq!(entity_id(&students[0]), Some(RANGA));
}

#[test]
fn dropping_a_course_from_a_student_deletes_the_link_row() {
    let db = school();
    let mut session = db.factory.open();
    let student = session.find("Student", RANGA).expect("find").expect("student exists");
    let spring = session.find("Course", SPRING).expect("find").expect("course exists");

    assert_eq!(student.many("courses").expect("load").len(), 2);
    assert!(student.remove_from("courses", &spring).expect("unenrol"));
    let summary = session.commit().expect("commit");

    assert_eq!(summary.unlinked, 1);
    assert_eq!(db.store.link_count("STUDENT_COURSE"), 2);
    assert_eq!(db.store.row_count("CourseDetails"), 3);
}

#[test]
fn inverse_side_changes_do_not_write_links() {
    let db = school();
    let mut session = db.factory.open();
    let course = session.find("Course", SPRING_BOOT).expect("find").expect("course exists");
    let adam = session.find("Student", ADAM).expect("find").expect("student exists");

    course.add_to("students", &adam).expect("add on inverse side");
    let summary = session.commit().expect("commit");

    assert_eq!(summary.linked, 0);
    assert_eq!(db.store.link_count("STUDENT_COURSE"), 3);
}

#[test]
fn new_student_enrolled_in_existing_courses() {
    let db = school();
    let mut session = db.factory.open();
    let jpa = session.find("Course", JPA).expect("find").expect("course exists");
    let spring = session.find("Course", SPRING).expect("find").expect("course exists");
    let passport = session
        .new_entity("Passport")
        .expect("registered type")
        .with("number", "L123890")
        .expect("number column")
        .into_ref();
    let student = session
        .new_entity("Student")
        .expect("registered type")
        .with("first_name", "Jack")
        .expect("first name")
        .with("last_name", "Jones")
        .expect("last name")
        .into_ref();
    student.set_one("passport", Some(&passport)).expect("set passport");
    student.add_to("courses", &jpa).expect("enrol");
    student.add_to("courses", &spring).expect("enrol");
    session.save(&student).expect("save");

    let summary = session.commit().expect("commit");
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.linked, 2);
    assert_eq!(db.store.link_count("STUDENT_COURSE"), 5);

    let student_id = entity_id(&student).expect("student key");
    let session = db.factory.open();
    let reloaded = session.find("Student", student_id).expect("find").expect("student stored");
    assert_eq!(reloaded.many("courses").expect("load").len(), 2);
}

#[test]
fn deleting_a_student_unlinks_before_deleting() {
    let db = school();
    let mut session = db.factory.open();
    assert!(session.delete("Student", ADAM).expect("delete"));

    let summary = session.commit().expect("commit");
    assert_eq!(summary.unlinked, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(db.store.link_count("STUDENT_COURSE"), 2);
    // Passport has no delete cascade from its student.
    assert!(db.store.raw_row("PassportDetails", N123457).is_some());

    let ops: Vec<_> = db.store.journal().into_iter().map(|entry| entry.op).collect();
    assert_eq!(ops, [StoreOp::DeleteLink, StoreOp::Delete]);
}

static EMPLOYEE: EntityType = EntityType::new("Employee", "employees")
    .columns(&[ColumnInfo::new("name", "name", SqlType::Text).nullable(false)])
    .relationships(&[
        RelationshipInfo::new("manager", "Employee", RelationshipKind::ManyToOne)
            .local_key("manager_id")
            .cascade(CascadePolicy::Save),
        RelationshipInfo::new("reports", "Employee", RelationshipKind::OneToMany)
            .remote_key("manager_id")
            .cascade(CascadePolicy::SaveAndDelete),
    ]);

fn employee(name: &str) -> EntityRef {
    EntityInstance::new(&EMPLOYEE)
        .with("name", name)
        .expect("name column")
        .into_ref()
}

#[test]
fn cascade_cycle_inserts_each_instance_once() {
    let schema = Schema::builder().register(&EMPLOYEE).build().expect("valid schema");
    let db = rowmap::in_memory(schema, None);
    let mut session = db.factory.open();

    let (alice, bob) = (employee("Alice"), employee("Bob"));
    alice.set_one("manager", Some(&bob)).expect("set manager");
    bob.set_one("manager", Some(&alice)).expect("set manager");
    alice.add_to("reports", &bob).expect("add report");
    bob.add_to("reports", &alice).expect("add report");
    session.save(&alice).expect("save");

    let summary = session.commit().expect("commit");

    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.cascaded, 1);
    assert_eq!(db.store.counts().insert, 2);
    // One foreign key is written by a follow-up update.
    assert_eq!(db.store.counts().update, 1);

    let alice_id = entity_id(&alice).expect("key");
    let bob_id = entity_id(&bob).expect("key");
    let row = |id| db.store.raw_row("employees", id).expect("row stored");
    assert_eq!(row(alice_id).get("manager_id"), Some(&Value::from(bob_id)));
    assert_eq!(row(bob_id).get("manager_id"), Some(&Value::from(alice_id)));
}

#[test]
fn deleting_a_manager_cascades_down_the_reporting_chain() {
    let schema = Schema::builder().register(&EMPLOYEE).build().expect("valid schema");
    let db = rowmap::in_memory(schema, None);
    let top = db.store.seed(&EMPLOYEE, Row::from_pairs([("name", Value::from("Top"))]));
    let middle = db.store.seed(
        &EMPLOYEE,
        Row::from_pairs([("name", Value::from("Middle")), ("manager_id", Value::from(top))]),
    );
    db.store.seed(
        &EMPLOYEE,
        Row::from_pairs([("name", Value::from("Bottom")), ("manager_id", Value::from(middle))]),
    );

    let mut session = db.factory.open();
    session.delete("Employee", top).expect("delete");
    let summary = session.commit().expect("commit");

    assert_eq!(summary.deleted, 3);
    assert_eq!(summary.cascaded, 2);
    assert_eq!(db.store.row_count("employees"), 0);
}
