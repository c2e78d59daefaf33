//! Migration and group definitions produced by the directive parser.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use indexmap::IndexSet;
use regex_lite::Regex;
use tracing::warn;

use crate::error::{MigrateResult, MigrationError};

/// Name of the synthetic group that holds every parsed file.
pub const ROOT_GROUP_NAME: &str = "root";

/// Separator between the segments of a canonical ID.
pub const SCOPE_SEPARATOR: &str = "::";

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("name pattern is valid"));

/// Whether `name` is a legal migration or group name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Execution tags understood on a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationTag {
    /// Run in an isolated execution context, possibly in parallel.
    Concurrent,
    /// Wrap the migration SQL in a transaction.
    Transactional,
}

impl MigrationTag {
    /// Parse a tag name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "concurrent" => Some(Self::Concurrent),
            "transactional" => Some(Self::Transactional),
            _ => None,
        }
    }

    /// The directive spelling of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrent => "CONCURRENT",
            Self::Transactional => "TRANSACTIONAL",
        }
    }
}

impl fmt::Display for MigrationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tags accepted on a group. Recorded but never change execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupTag {
    Concurrent,
    Transactional,
}

impl GroupTag {
    /// Parse a tag name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match MigrationTag::from_name(name)? {
            MigrationTag::Concurrent => Some(Self::Concurrent),
            MigrationTag::Transactional => Some(Self::Transactional),
        }
    }

    /// The directive spelling of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrent => "CONCURRENT",
            Self::Transactional => "TRANSACTIONAL",
        }
    }
}

impl fmt::Display for GroupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn push_line(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(text);
}

fn push_unique(target: &mut Vec<String>, value: &str) {
    if !target.iter().any(|existing| existing == value) {
        target.push(value.to_string());
    }
}

/// A named SQL unit with metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    file_path: String,
    name: String,
    serial: usize,
    start_line: usize,
    end_line: Option<usize>,
    sql: String,
    description: String,
    tags: IndexSet<MigrationTag>,
    migration_dependencies: Vec<String>,
    group_dependencies: Vec<String>,
}

impl Migration {
    /// Create a migration without validation.
    ///
    /// The parser uses this while walking a file; callers building
    /// migrations by hand should prefer [`Migration::create`].
    pub fn new(
        file_path: impl Into<String>,
        name: impl Into<String>,
        serial: usize,
        sql: impl Into<String>,
        start_line: usize,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            name: name.into(),
            serial,
            start_line,
            end_line: None,
            sql: sql.into(),
            description: String::new(),
            tags: IndexSet::new(),
            migration_dependencies: Vec::new(),
            group_dependencies: Vec::new(),
        }
    }

    /// Create a validated migration.
    ///
    /// Rejects an empty file path, an illegal name, a zero serial or start
    /// line, empty SQL, and a source file that does not exist on disk.
    pub async fn create(
        file_path: impl Into<String>,
        name: impl Into<String>,
        serial: usize,
        sql: impl Into<String>,
        start_line: usize,
    ) -> MigrateResult<Self> {
        let file_path = file_path.into();
        let name = name.into();

        let sql = sql.into();

        if file_path.trim().is_empty() {
            return Err(MigrationError::invalid_migration("file path must not be empty"));
        }
        if !is_valid_name(&name) {
            return Err(MigrationError::invalid_migration(format!(
                "'{name}' is not a valid migration name"
            )));
        }
        if serial == 0 {
            return Err(MigrationError::invalid_migration(format!(
                "serial of '{name}' must be positive"
            )));
        }
        if start_line == 0 {
            return Err(MigrationError::invalid_migration(format!(
                "start line of '{name}' must be positive"
            )));
        }
        if sql.trim().is_empty() {
            return Err(MigrationError::invalid_migration(format!(
                "migration '{name}' has no SQL"
            )));
        }
        if !tokio::fs::try_exists(Path::new(&file_path)).await? {
            return Err(MigrationError::invalid_migration(format!(
                "file '{file_path}' for migration '{name}' does not exist"
            )));
        }

        Ok(Self::new(file_path, name, serial, sql, start_line))
    }

    /// Set the closing line.
    pub fn with_end_line(mut self, end_line: usize) -> Self {
        self.end_line = Some(end_line);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: MigrationTag) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Add a migration dependency.
    pub fn with_dependency(mut self, dependency: &str) -> Self {
        self.add_migration_dependency(dependency);
        self
    }

    /// Add a group dependency.
    pub fn with_group_dependency(mut self, dependency: &str) -> Self {
        self.add_group_dependency(dependency);
        self
    }

    /// Record the closing line.
    pub fn close(&mut self, end_line: usize) {
        self.end_line = Some(end_line);
    }

    /// Append a line of SQL.
    pub fn add_to_sql(&mut self, line: &str) {
        if line.trim().is_empty() {
            warn!(migration = %self.name, "ignoring empty SQL line");
            return;
        }
        push_line(&mut self.sql, line);
    }

    /// Append a line of description.
    pub fn add_to_description(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            warn!(migration = %self.name, "ignoring empty description line");
            return;
        }
        push_line(&mut self.description, line);
    }

    /// Add tags; duplicates are ignored.
    pub fn add_tags(&mut self, tags: &[MigrationTag]) {
        if tags.is_empty() {
            warn!(migration = %self.name, "ignoring empty tag list");
            return;
        }
        for tag in tags {
            if !self.tags.insert(*tag) {
                warn!(migration = %self.name, tag = %tag, "duplicate tag");
            }
        }
    }

    /// Add a dependency on another migration (or group, resolved later).
    pub fn add_migration_dependency(&mut self, dependency: &str) {
        let dependency = dependency.trim();
        if dependency.is_empty() {
            warn!(migration = %self.name, "ignoring empty migration dependency");
            return;
        }
        push_unique(&mut self.migration_dependencies, dependency);
    }

    /// Add a dependency on a group.
    pub fn add_group_dependency(&mut self, dependency: &str) {
        let dependency = dependency.trim();
        if dependency.is_empty() {
            warn!(migration = %self.name, "ignoring empty group dependency");
            return;
        }
        push_unique(&mut self.group_dependencies, dependency);
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> usize {
        self.serial
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    pub fn end_line(&self) -> Option<usize> {
        self.end_line
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> &IndexSet<MigrationTag> {
        &self.tags
    }

    pub fn migration_dependencies(&self) -> &[String] {
        &self.migration_dependencies
    }

    pub fn group_dependencies(&self) -> &[String] {
        &self.group_dependencies
    }

    /// Whether the migration runs in an isolated execution context.
    pub fn is_concurrent(&self) -> bool {
        self.tags.contains(&MigrationTag::Concurrent)
    }

    /// Whether the migration runs inside a transaction.
    pub fn is_transactional(&self) -> bool {
        self.tags.contains(&MigrationTag::Transactional)
    }

    /// Human readable line span, e.g. `2-9`.
    pub fn line_range(&self) -> String {
        match self.end_line {
            Some(end) => format!("{}-{}", self.start_line, end),
            None => format!("{}-?", self.start_line),
        }
    }
}

/// A named scope containing migrations and child groups.
///
/// Files are groups too: each parsed file becomes a group named by its
/// path, and all files hang off a single [`ROOT_GROUP_NAME`] group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationGroup {
    name: String,
    serial: usize,
    start_line: usize,
    end_line: Option<usize>,
    description: String,
    tags: IndexSet<GroupTag>,
    migrations: Vec<Arc<Migration>>,
    groups: Vec<MigrationGroup>,
    migration_dependencies: Vec<String>,
    group_dependencies: Vec<String>,
}

impl MigrationGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>, serial: usize, start_line: usize) -> Self {
        Self {
            name: name.into(),
            serial,
            start_line,
            end_line: None,
            description: String::new(),
            tags: IndexSet::new(),
            migrations: Vec::new(),
            groups: Vec::new(),
            migration_dependencies: Vec::new(),
            group_dependencies: Vec::new(),
        }
    }

    /// Create the global root group.
    pub fn root() -> Self {
        Self::new(ROOT_GROUP_NAME, 0, 1)
    }

    /// Record the closing line.
    pub fn close(&mut self, end_line: usize) {
        self.end_line = Some(end_line);
    }

    /// Append a closed migration.
    pub fn add_migration(&mut self, migration: Arc<Migration>) {
        self.migrations.push(migration);
    }

    /// Append a closed child group.
    pub fn add_group(&mut self, group: MigrationGroup) {
        self.groups.push(group);
    }

    /// Builder form of [`MigrationGroup::add_migration`].
    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.add_migration(Arc::new(migration));
        self
    }

    /// Builder form of [`MigrationGroup::add_group`].
    pub fn with_group(mut self, group: MigrationGroup) -> Self {
        self.add_group(group);
        self
    }

    /// Builder form of [`MigrationGroup::add_group_dependency`].
    pub fn with_group_dependency(mut self, dependency: &str) -> Self {
        self.add_group_dependency(dependency);
        self
    }

    /// Builder form of [`MigrationGroup::add_migration_dependency`].
    pub fn with_dependency(mut self, dependency: &str) -> Self {
        self.add_migration_dependency(dependency);
        self
    }

    pub fn add_to_description(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            warn!(group = %self.name, "ignoring empty description line");
            return;
        }
        push_line(&mut self.description, line);
    }

    pub fn add_tags(&mut self, tags: &[GroupTag]) {
        if tags.is_empty() {
            warn!(group = %self.name, "ignoring empty tag list");
            return;
        }
        for tag in tags {
            if !self.tags.insert(*tag) {
                warn!(group = %self.name, tag = %tag, "duplicate tag");
            }
        }
    }

    pub fn add_migration_dependency(&mut self, dependency: &str) {
        let dependency = dependency.trim();
        if dependency.is_empty() {
            warn!(group = %self.name, "ignoring empty migration dependency");
            return;
        }
        push_unique(&mut self.migration_dependencies, dependency);
    }

    pub fn add_group_dependency(&mut self, dependency: &str) {
        let dependency = dependency.trim();
        if dependency.is_empty() {
            warn!(group = %self.name, "ignoring empty group dependency");
            return;
        }
        push_unique(&mut self.group_dependencies, dependency);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> usize {
        self.serial
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    pub fn end_line(&self) -> Option<usize> {
        self.end_line
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> &IndexSet<GroupTag> {
        &self.tags
    }

    /// Direct migrations in declaration order.
    pub fn migrations(&self) -> &[Arc<Migration>] {
        &self.migrations
    }

    /// Direct child groups in declaration order.
    pub fn groups(&self) -> &[MigrationGroup] {
        &self.groups
    }

    pub fn migration_dependencies(&self) -> &[String] {
        &self.migration_dependencies
    }

    pub fn group_dependencies(&self) -> &[String] {
        &self.group_dependencies
    }

    /// Walk every migration in this group and its descendants.
    ///
    /// Order is depth-first: a group's own migrations, then each child
    /// group in declaration order.
    pub fn iter(&self) -> MigrationIter<'_> {
        MigrationIter {
            stack: Vec::new(),
            current: Some((self, self.migrations.iter())),
        }
    }

    /// Total number of migrations in the subtree.
    pub fn migration_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(group) = pending.pop() {
            count += group.migrations.len();
            pending.extend(&group.groups);
        }
        count
    }
}

impl Drop for MigrationGroup {
    // Flatten the subtree first so deep nesting is not dropped recursively.
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.groups);
        while let Some(mut group) = pending.pop() {
            pending.append(&mut group.groups);
        }
    }
}

impl<'a> IntoIterator for &'a MigrationGroup {
    type Item = MigrationEntry<'a>;
    type IntoIter = MigrationIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A migration yielded by [`MigrationIter`] with the name of its owning group.
#[derive(Debug, Clone, Copy)]
pub struct MigrationEntry<'a> {
    pub migration: &'a Arc<Migration>,
    pub group: &'a str,
}

/// Lazy depth-first iterator over a group tree.
#[derive(Debug)]
pub struct MigrationIter<'a> {
    stack: Vec<&'a MigrationGroup>,
    current: Option<(&'a MigrationGroup, std::slice::Iter<'a, Arc<Migration>>)>,
}

impl<'a> Iterator for MigrationIter<'a> {
    type Item = MigrationEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((group, migrations)) = &mut self.current {
                let group: &'a MigrationGroup = *group;
                if let Some(migration) = migrations.next() {
                    return Some(MigrationEntry {
                        migration,
                        group: group.name.as_str(),
                    });
                }
            }

            if let Some((finished, _)) = self.current.take() {
                self.stack.extend(finished.groups.iter().rev());
            }

            let next = self.stack.pop()?;
            self.current = Some((next, next.migrations.iter()));
        }
    }
}
