//! Static entity schema metadata.
//!
//! Entity types are declared as `static` values built with `const fn`
//! builders and registered once into an immutable [`Schema`]. Everything the
//! session needs (columns, relationship edges, cascade policy, soft-delete
//! and timestamp columns) is read from this metadata; there is no runtime
//! reflection.
//!
//! ```
//! use rowmap_core::schema::*;
//!
//! static COURSE: EntityType = EntityType::new("Course", "CourseDetails")
//!     .columns(&[ColumnInfo::new("name", "courseName", SqlType::Text).nullable(false)])
//!     .relationships(&[RelationshipInfo::new("reviews", "Review", RelationshipKind::OneToMany)
//!         .remote_key("course_id")]);
//!
//! static REVIEW: EntityType = EntityType::new("Review", "ReviewDetails")
//!     .columns(&[ColumnInfo::new("rating", "rating", SqlType::Text)])
//!     .relationships(&[RelationshipInfo::new("course", "Course", RelationshipKind::ManyToOne)
//!         .local_key("course_id")]);
//!
//! let schema = Schema::builder().register(&COURSE).register(&REVIEW).build().unwrap();
//! assert_eq!(schema.entity("Course").unwrap().table, "CourseDetails");
//! ```

use crate::error::{Error, Result, SchemaErrorKind};
use crate::identifiers::is_valid_identifier;
use std::collections::{HashMap, HashSet};

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int,
    BigInt,
    Double,
    Text,
    Bytes,
    Timestamp,
    Json,
}

/// A scalar column on an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Field name used by callers (`instance.get("name")`).
    pub name: &'static str,
    /// Column name in the row store.
    pub column_name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnInfo {
    #[must_use]
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: true,
        }
    }

    #[must_use]
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }
}

/// The type of relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many `Review`s belong to one `Course`; foreign key on this side.
    ManyToOne,
    /// One `Student` has one `Passport`; foreign key on either side.
    OneToOne,
    /// One `Course` has many `Review`s; foreign key on the target.
    OneToMany,
    /// `Student`s have many `Course`s through a link table.
    ManyToMany,
}

/// How many targets a relationship field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    One,
    Many,
}

/// Which side stores the association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwningSide {
    /// This type holds the foreign key column.
    Local,
    /// The target type holds the foreign key column.
    Remote,
    /// A link table holds `(local, remote)` key pairs.
    LinkTable,
}

/// Which operations propagate across a relationship edge at commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CascadePolicy {
    #[default]
    None,
    /// Unsaved targets are inserted along with the owner.
    Save,
    /// As `Save`, and deleting the owner deletes its targets.
    SaveAndDelete,
}

impl CascadePolicy {
    pub const fn cascades_save(self) -> bool {
        matches!(self, CascadePolicy::Save | CascadePolicy::SaveAndDelete)
    }

    pub const fn cascades_delete(self) -> bool {
        matches!(self, CascadePolicy::SaveAndDelete)
    }
}

/// Link table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    pub table_name: &'static str,
    /// Column holding this side's key.
    pub local_column: &'static str,
    /// Column holding the target's key.
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }
}

/// A relationship field on an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Field name.
    pub name: &'static str,
    /// Target entity type name.
    pub target: &'static str,
    pub kind: RelationshipKind,
    /// Foreign key column on this type (owning to-one).
    pub local_key: Option<&'static str>,
    /// Foreign key column on the target (inverse to-one, one-to-many).
    pub remote_key: Option<&'static str>,
    pub link_table: Option<LinkTableInfo>,
    /// Inverse many-to-many: name of the owning field on the target.
    pub mapped_by: Option<&'static str>,
    pub cascade: CascadePolicy,
}

impl RelationshipInfo {
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: RelationshipKind) -> Self {
        Self {
            name,
            target,
            kind,
            local_key: None,
            remote_key: None,
            link_table: None,
            mapped_by: None,
            cascade: CascadePolicy::None,
        }
    }

    #[must_use]
    pub const fn local_key(mut self, column: &'static str) -> Self {
        self.local_key = Some(column);
        self
    }

    #[must_use]
    pub const fn remote_key(mut self, column: &'static str) -> Self {
        self.remote_key = Some(column);
        self
    }

    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    #[must_use]
    pub const fn mapped_by(mut self, field: &'static str) -> Self {
        self.mapped_by = Some(field);
        self
    }

    #[must_use]
    pub const fn cascade(mut self, policy: CascadePolicy) -> Self {
        self.cascade = policy;
        self
    }

    pub const fn multiplicity(&self) -> Multiplicity {
        match self.kind {
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne => Multiplicity::One,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => Multiplicity::Many,
        }
    }

    pub const fn owning_side(&self) -> OwningSide {
        if self.local_key.is_some() {
            OwningSide::Local
        } else if self.link_table.is_some() {
            OwningSide::LinkTable
        } else {
            OwningSide::Remote
        }
    }

    /// Does flushing this side write the association?
    ///
    /// True for local foreign keys and for the non-`mapped_by` side of a
    /// many-to-many.
    pub const fn writes_association(&self) -> bool {
        match self.owning_side() {
            OwningSide::Local => true,
            OwningSide::LinkTable => self.mapped_by.is_none(),
            OwningSide::Remote => false,
        }
    }
}

/// Schema for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityType {
    pub name: &'static str,
    pub table: &'static str,
    /// Primary key column; keys are store-assigned `BIGINT`s.
    pub primary_key: &'static str,
    pub columns: &'static [ColumnInfo],
    pub relationships: &'static [RelationshipInfo],
    /// Boolean column marking logically deleted rows.
    pub soft_delete: Option<&'static str>,
    /// Column set once on INSERT.
    pub created_timestamp: Option<&'static str>,
    /// Column refreshed on every INSERT, UPDATE and soft delete.
    pub updated_timestamp: Option<&'static str>,
    /// Whether snapshots go to the second-level cache.
    pub cacheable: bool,
}

impl EntityType {
    #[must_use]
    pub const fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            primary_key: "id",
            columns: &[],
            relationships: &[],
            soft_delete: None,
            created_timestamp: None,
            updated_timestamp: None,
            cacheable: false,
        }
    }

    #[must_use]
    pub const fn primary_key(mut self, column: &'static str) -> Self {
        self.primary_key = column;
        self
    }

    #[must_use]
    pub const fn columns(mut self, columns: &'static [ColumnInfo]) -> Self {
        self.columns = columns;
        self
    }

    #[must_use]
    pub const fn relationships(mut self, relationships: &'static [RelationshipInfo]) -> Self {
        self.relationships = relationships;
        self
    }

    /// Declare the soft-delete flag column (must also be a `Bool` column).
    #[must_use]
    pub const fn soft_delete(mut self, column: &'static str) -> Self {
        self.soft_delete = Some(column);
        self
    }

    #[must_use]
    pub const fn created_timestamp(mut self, column: &'static str) -> Self {
        self.created_timestamp = Some(column);
        self
    }

    #[must_use]
    pub const fn updated_timestamp(mut self, column: &'static str) -> Self {
        self.updated_timestamp = Some(column);
        self
    }

    #[must_use]
    pub const fn cacheable(mut self, value: bool) -> Self {
        self.cacheable = value;
        self
    }

    pub const fn is_soft_deletable(&self) -> bool {
        self.soft_delete.is_some()
    }

    /// Look up a scalar column by field name.
    pub fn column(&self, field: &str) -> Option<&'static ColumnInfo> {
        self.columns.iter().find(|c| c.name == field)
    }

    /// Look up a scalar column by store column name.
    pub fn column_by_name(&self, column: &str) -> Option<&'static ColumnInfo> {
        self.columns.iter().find(|c| c.column_name == column)
    }

    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Relationship whose local foreign key is `column`.
    pub fn relationship_by_local_key(&self, column: &str) -> Option<&'static RelationshipInfo> {
        self.relationships
            .iter()
            .find(|r| r.local_key == Some(column))
    }
}

/// Immutable registry of entity types, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<&'static str, &'static EntityType>,
    order: Vec<&'static str>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up an entity type, failing for unregistered names.
    pub fn entity(&self, name: &str) -> Result<&'static EntityType> {
        self.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("entity type '{}' is not registered", name),
            )
        })
    }

    pub fn get(&self, name: &str) -> Option<&'static EntityType> {
        self.types.get(name).copied()
    }

    /// Registered types in registration order.
    pub fn types(&self) -> impl Iterator<Item = &'static EntityType> + '_ {
        self.order.iter().filter_map(|n| self.types.get(n).copied())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Collects entity types and validates them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: Vec<&'static EntityType>,
}

impl SchemaBuilder {
    #[must_use]
    pub fn register(mut self, entity: &'static EntityType) -> Self {
        self.types.push(entity);
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut types = HashMap::new();
        let mut order = Vec::new();
        for ty in &self.types {
            validate_entity(ty)?;
            if types.insert(ty.name, *ty).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::Duplicate,
                    format!("entity type '{}' registered twice", ty.name),
                ));
            }
            order.push(ty.name);
        }

        for ty in &self.types {
            for rel in ty.relationships {
                let Some(target) = types.get(rel.target) else {
                    return Err(Error::schema(
                        SchemaErrorKind::UnknownTarget,
                        format!(
                            "{}.{} targets unregistered type '{}'",
                            ty.name, rel.name, rel.target
                        ),
                    ));
                };
                validate_remote_key(ty, rel, target)?;
            }
        }

        tracing::debug!(types = order.len(), "Schema built");
        Ok(Schema { types, order })
    }
}

fn check_ident(owner: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::schema(
            SchemaErrorKind::InvalidIdentifier,
            format!("{}: invalid identifier '{}'", owner, name),
        ))
    }
}

fn validate_entity(ty: &EntityType) -> Result<()> {
    check_ident(ty.name, ty.name)?;
    check_ident(ty.name, ty.table)?;
    check_ident(ty.name, ty.primary_key)?;

    let mut fields = HashSet::new();
    let mut columns = HashSet::from([ty.primary_key]);
    for col in ty.columns {
        check_ident(ty.name, col.name)?;
        check_ident(ty.name, col.column_name)?;
        if !fields.insert(col.name) || !columns.insert(col.column_name) {
            return Err(Error::schema(
                SchemaErrorKind::Duplicate,
                format!("{}: column '{}' declared twice", ty.name, col.name),
            ));
        }
    }

    for rel in ty.relationships {
        check_ident(ty.name, rel.name)?;
        if !fields.insert(rel.name) {
            return Err(Error::schema(
                SchemaErrorKind::Duplicate,
                format!("{}: field '{}' declared twice", ty.name, rel.name),
            ));
        }
        validate_relationship_shape(ty, rel)?;
        if let Some(fk) = rel.local_key {
            check_ident(ty.name, fk)?;
            if !columns.insert(fk) {
                return Err(Error::schema(
                    SchemaErrorKind::Duplicate,
                    format!("{}: foreign key '{}' clashes with another column", ty.name, fk),
                ));
            }
        }
    }

    if let Some(flag) = ty.soft_delete {
        match ty.column_by_name(flag) {
            Some(col) if col.sql_type == SqlType::Bool => {}
            _ => {
                return Err(Error::schema(
                    SchemaErrorKind::MissingColumn,
                    format!("{}: soft-delete flag '{}' must be a Bool column", ty.name, flag),
                ));
            }
        }
    }
    for ts in [ty.created_timestamp, ty.updated_timestamp].into_iter().flatten() {
        if ty.column_by_name(ts).is_none() {
            return Err(Error::schema(
                SchemaErrorKind::MissingColumn,
                format!("{}: timestamp column '{}' is not declared", ty.name, ts),
            ));
        }
    }
    Ok(())
}

fn validate_relationship_shape(ty: &EntityType, rel: &RelationshipInfo) -> Result<()> {
    let ok = match rel.kind {
        RelationshipKind::ManyToOne => rel.local_key.is_some() && rel.remote_key.is_none(),
        RelationshipKind::OneToOne => rel.local_key.is_some() != rel.remote_key.is_some(),
        RelationshipKind::OneToMany => rel.remote_key.is_some() && rel.local_key.is_none(),
        RelationshipKind::ManyToMany => rel.link_table.is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::schema(
            SchemaErrorKind::MissingColumn,
            format!(
                "{}.{}: {:?} relationship is missing its key declaration",
                ty.name, rel.name, rel.kind
            ),
        ))
    }
}

/// The target must own the foreign key an inverse side reads through.
fn validate_remote_key(
    ty: &EntityType,
    rel: &RelationshipInfo,
    target: &EntityType,
) -> Result<()> {
    let Some(fk) = rel.remote_key else {
        return Ok(());
    };
    match target.relationship_by_local_key(fk) {
        Some(back) if back.target == ty.name => Ok(()),
        _ => Err(Error::schema(
            SchemaErrorKind::MissingColumn,
            format!(
                "{}.{}: '{}' has no foreign key '{}' pointing back",
                ty.name, rel.name, target.name, fk
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEAM: EntityType = EntityType::new("Team", "teams")
        .columns(&[ColumnInfo::new("name", "name", SqlType::Text)])
        .relationships(&[
            RelationshipInfo::new("heroes", "Hero", RelationshipKind::OneToMany)
                .remote_key("team_id")
                .cascade(CascadePolicy::SaveAndDelete),
        ]);

    static HERO: EntityType = EntityType::new("Hero", "heroes")
        .columns(&[
            ColumnInfo::new("name", "name", SqlType::Text).nullable(false),
            ColumnInfo::new("deleted", "is_deleted", SqlType::Bool),
        ])
        .relationships(&[RelationshipInfo::new("team", "Team", RelationshipKind::ManyToOne)
            .local_key("team_id")])
        .soft_delete("is_deleted");

    #[test]
    fn test_schema_registers_types() {
        let schema = Schema::builder()
            .register(&TEAM)
            .register(&HERO)
            .build()
            .unwrap();
        assert_eq!(schema.len(), 2);
        let names: Vec<_> = schema.types().map(|t| t.name).collect();
        assert_eq!(names, vec!["Team", "Hero"]);
        assert!(schema.entity("Hero").unwrap().is_soft_deletable());
        assert!(schema.entity("Villain").is_err());
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = Schema::builder().register(&HERO).build().unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(ref e) if e.kind == SchemaErrorKind::UnknownTarget
        ));
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let err = Schema::builder()
            .register(&TEAM)
            .register(&HERO)
            .register(&TEAM)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref e) if e.kind == SchemaErrorKind::Duplicate));
    }

    #[test]
    fn test_soft_delete_column_must_exist() {
        static BAD: EntityType = EntityType::new("Bad", "bad").soft_delete("is_deleted");
        let err = Schema::builder().register(&BAD).build().unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(ref e) if e.kind == SchemaErrorKind::MissingColumn
        ));
    }

    #[test]
    fn test_invalid_table_identifier_rejected() {
        static BAD: EntityType = EntityType::new("Bad", "bad table");
        let err = Schema::builder().register(&BAD).build().unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(ref e) if e.kind == SchemaErrorKind::InvalidIdentifier
        ));
    }

    #[test]
    fn test_remote_key_must_point_back() {
        static ORPHAN: EntityType = EntityType::new("Orphan", "orphans").relationships(&[
            RelationshipInfo::new("heroes", "Hero", RelationshipKind::OneToMany)
                .remote_key("team_id"),
        ]);
        let err = Schema::builder()
            .register(&TEAM)
            .register(&HERO)
            .register(&ORPHAN)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("pointing back"));
    }

    #[test]
    fn test_relationship_metadata() {
        let heroes = TEAM.relationship("heroes").unwrap();
        assert_eq!(heroes.multiplicity(), Multiplicity::Many);
        assert_eq!(heroes.owning_side(), OwningSide::Remote);
        assert!(!heroes.writes_association());
        assert!(heroes.cascade.cascades_delete());

        let team = HERO.relationship("team").unwrap();
        assert_eq!(team.owning_side(), OwningSide::Local);
        assert!(team.writes_association());
        assert_eq!(HERO.relationship_by_local_key("team_id"), Some(team));
    }
}
