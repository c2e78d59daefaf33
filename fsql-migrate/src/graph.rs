//! Dependency graph resolution.
//!
//! Assigns every migration and group a canonical ID (`root::<file>::<group>::<name>`)
//! and resolves each raw dependency string into one. Resolution is two-pass:
//! IDs are collected first so that a deeper occurrence of a bare name can
//! replace a shallower one seen earlier, then every dependency is resolved
//! against the finished name tables.
//!
//! Reference forms, in precedence order:
//!
//! | Form | Example | Resolves against |
//! |------|---------|------------------|
//! | Path-qualified | `::../shared/001-base.sql::create_roles` | current file directory / base dir |
//! | Bare migration name | `create_users` | migration table, then group table |
//! | Bare group name | `accounts` | group table only (group dependencies) |
//! | Absolute path | `/001-base.sql` | base migrations directory |
//!
//! Anything else is kept verbatim and reported as missing by the organizer.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::model::{MigrationGroup, ROOT_GROUP_NAME, SCOPE_SEPARATOR};

/// Resolved dependencies of one migration or group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    pub migration_dependencies: IndexSet<String>,
    pub group_dependencies: IndexSet<String>,
}

impl DependencySet {
    pub fn is_empty(&self) -> bool {
        self.migration_dependencies.is_empty() && self.group_dependencies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migration_dependencies.len() + self.group_dependencies.len()
    }
}

/// Canonical-ID keyed dependency mappings for migrations and groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    migrations: IndexMap<String, DependencySet>,
    groups: IndexMap<String, DependencySet>,
    base_dir: String,
}

impl DependencyGraph {
    /// Build the graph, deriving the base directory from the file roots.
    pub fn build(root: &MigrationGroup) -> Self {
        let base_dir = derive_base_dir(root);
        Resolver::new(root, base_dir).build(root)
    }

    /// Build the graph against an explicit base migrations directory.
    pub fn build_with_base(root: &MigrationGroup, base_dir: impl Into<String>) -> Self {
        let base_dir = base_dir.into();
        let base_dir = base_dir.trim_end_matches('/').to_string();
        Resolver::new(root, base_dir).build(root)
    }

    /// Dependencies keyed by migration ID, in tree order.
    pub fn migrations(&self) -> &IndexMap<String, DependencySet> {
        &self.migrations
    }

    /// Dependencies keyed by group ID, in tree order.
    pub fn groups(&self) -> &IndexMap<String, DependencySet> {
        &self.groups
    }

    pub fn migration(&self, id: &str) -> Option<&DependencySet> {
        self.migrations.get(id)
    }

    pub fn group(&self, id: &str) -> Option<&DependencySet> {
        self.groups.get(id)
    }

    /// The directory absolute references were resolved against.
    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    /// Total number of declared edges.
    pub fn edge_count(&self) -> usize {
        self.migrations.values().chain(self.groups.values()).map(DependencySet::len).sum()
    }
}

/// Join a parent ID and a child name with [`SCOPE_SEPARATOR`].
pub fn join_id(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}{SCOPE_SEPARATOR}{name}")
    }
}

/// Collapse `.` and `..` segments and repeated separators.
///
/// A leading `/` is preserved; `..` that climbs past the start of a
/// relative path is kept, past the root of an absolute path it is dropped.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ if !absolute => parts.push(".."),
                _ => {}
            },
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

fn join_path(dir: &str, path: &str) -> String {
    match dir {
        "" => path.to_string(),
        "/" => format!("/{path}"),
        _ => format!("{dir}/{path}"),
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => "",
    }
}

/// Directory of the file a group ID lives in.
fn current_dir(group_id: &str) -> &str {
    let segments: Vec<&str> = group_id.split(SCOPE_SEPARATOR).collect();
    if let Some(file) = segments.iter().find(|s| s.ends_with(".sql")) {
        return parent_dir(*file);
    }
    segments
        .iter()
        .rev()
        .find(|s| s.contains('/'))
        .map(|s| parent_dir(*s))
        .unwrap_or_default()
}

/// Longest common directory of every file root under `root`.
fn derive_base_dir(root: &MigrationGroup) -> String {
    let files: Vec<&str> = if root.name() == ROOT_GROUP_NAME {
        root.groups().iter().map(MigrationGroup::name).collect()
    } else {
        vec![root.name()]
    };

    let mut dirs = files
        .into_iter()
        .filter(|name| name.ends_with(".sql"))
        .map(|name| match parent_dir(name) {
            "" => Vec::new(),
            "/" => vec![""],
            dir => dir.split('/').collect::<Vec<_>>(),
        });

    let Some(mut common) = dirs.next() else {
        return String::new();
    };
    for dir in dirs {
        let shared = common.iter().zip(&dir).take_while(|(a, b)| a == b).count();
        common.truncate(shared);
    }

    match common.as_slice() {
        [""] => "/".to_string(),
        _ => common.join("/"),
    }
}

/// Pre-order walk yielding each group with its canonical ID and depth.
///
/// Uses an explicit stack so nesting depth is bounded by memory only.
fn walk(root: &MigrationGroup) -> impl Iterator<Item = (&MigrationGroup, String, usize)> {
    let mut stack = vec![(root, root.name().to_string(), 0)];
    std::iter::from_fn(move || {
        let (group, group_id, depth) = stack.pop()?;
        stack.extend(
            group
                .groups()
                .iter()
                .rev()
                .map(|child| (child, join_id(&group_id, child.name()), depth + 1)),
        );
        Some((group, group_id, depth))
    })
}

struct Resolver {
    base_dir: String,
    /// `Some("root")` when the tree hangs off the global root group.
    root_prefix: Option<String>,
    migration_ids: HashMap<String, (String, usize)>,
    group_ids: HashMap<String, String>,
}

impl Resolver {
    fn new(root: &MigrationGroup, base_dir: String) -> Self {
        let root_prefix = (root.name() == ROOT_GROUP_NAME).then(|| root.name().to_string());
        let mut resolver = Self {
            base_dir,
            root_prefix,
            migration_ids: HashMap::new(),
            group_ids: HashMap::new(),
        };
        resolver.collect(root);
        resolver
    }

    fn collect(&mut self, root: &MigrationGroup) {
        for (group, group_id, depth) in walk(root) {
            for migration in group.migrations() {
                let shallower = self
                    .migration_ids
                    .get(migration.name())
                    .is_none_or(|(_, existing)| *existing < depth);
                if shallower {
                    self.migration_ids.insert(
                        migration.name().to_string(),
                        (join_id(&group_id, migration.name()), depth),
                    );
                }
            }
            self.group_ids.insert(group.name().to_string(), group_id);
        }
    }

    fn build(self, root: &MigrationGroup) -> DependencyGraph {
        let mut graph = DependencyGraph {
            base_dir: self.base_dir.clone(),
            ..DependencyGraph::default()
        };
        self.process(root, &mut graph);
        debug!(
            migrations = graph.migrations.len(),
            groups = graph.groups.len(),
            edges = graph.edge_count(),
            base_dir = %graph.base_dir,
            "dependency graph built"
        );
        graph
    }

    fn process(&self, root: &MigrationGroup, graph: &mut DependencyGraph) {
        for (group, group_id, depth) in walk(root) {
            for migration in group.migrations() {
                let deps = self.resolve_all(
                    migration.migration_dependencies(),
                    migration.group_dependencies(),
                    &group_id,
                );
                graph.migrations.insert(join_id(&group_id, migration.name()), deps);
            }

            let is_global_root = depth == 0 && group.name() == ROOT_GROUP_NAME;
            if !is_global_root {
                let deps = self.resolve_all(
                    group.migration_dependencies(),
                    group.group_dependencies(),
                    &group_id,
                );
                graph.groups.insert(group_id, deps);
            }
        }
    }

    fn resolve_all(&self, migrations: &[String], groups: &[String], group_id: &str) -> DependencySet {
        DependencySet {
            migration_dependencies: migrations
                .iter()
                .map(|dep| self.resolve(dep, group_id, false))
                .collect(),
            group_dependencies: groups
                .iter()
                .map(|dep| self.resolve(dep, group_id, true))
                .collect(),
        }
    }

    fn resolve(&self, dependency: &str, group_id: &str, group_only: bool) -> String {
        if let Some(reference) = dependency.strip_prefix(SCOPE_SEPARATOR) {
            return self.resolve_qualified(reference, group_id);
        }

        let found = if group_only {
            self.group_ids.get(dependency)
        } else {
            self.migration_ids
                .get(dependency)
                .map(|(id, _)| id)
                .or_else(|| self.group_ids.get(dependency))
        };
        if let Some(id) = found {
            return id.clone();
        }

        if dependency.starts_with('/') && !dependency.contains(SCOPE_SEPARATOR) {
            return self.qualify(&normalize_path(&format!("{}{}", self.base_dir, dependency)));
        }

        debug!(dependency, scope = group_id, "dependency left unresolved");
        dependency.to_string()
    }

    /// Resolve `path[:name]` or `path::group::...::name`.
    fn resolve_qualified(&self, reference: &str, group_id: &str) -> String {
        let mut segments = reference.split(SCOPE_SEPARATOR);
        let first = segments.next().unwrap_or_default();
        let mut targets: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();

        let path = match first.rsplit_once(':') {
            Some((path, target)) if targets.is_empty() && !path.is_empty() && !target.is_empty() => {
                targets.push(target);
                path
            }
            _ => first,
        };

        let mut id = self.qualify(&self.absolute_path(path, group_id));
        for target in targets {
            id = join_id(&id, target);
        }
        id
    }

    fn absolute_path(&self, path: &str, group_id: &str) -> String {
        let dir = current_dir(group_id);
        let combined = if path.starts_with("./") || path.starts_with("../") {
            join_path(dir, path)
        } else if path.starts_with('/') {
            format!("{}{}", self.base_dir, path)
        } else if path.contains('/') {
            join_path(&self.base_dir, path)
        } else {
            join_path(dir, path)
        };
        normalize_path(&combined)
    }

    fn qualify(&self, path: &str) -> String {
        match &self.root_prefix {
            Some(root) => join_id(root, path),
            None => path.to_string(),
        }
    }
}
