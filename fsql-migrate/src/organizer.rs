//! Validation and topological ordering of the dependency graph.
//!
//! The organizer never returns a partial order: either every migration is
//! placed, or the complete list of [`OrganizeError`]s is returned and nothing
//! runs.
//!
//! Group dependencies are expanded here. A dependency on a group becomes an
//! edge to every migration the group transitively owns, and dependencies
//! declared on a group apply to every migration below it.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, info};

use crate::error::OrganizeError;
use crate::graph::{DependencyGraph, DependencySet, join_id};
use crate::model::{Migration, MigrationGroup};

/// A migration placed in execution order.
#[derive(Debug, Clone)]
pub struct OrganizedMigration {
    /// Canonical ID.
    pub id: String,
    /// Shared with the parsed tree.
    pub migration: Arc<Migration>,
    /// Canonical ID of the owning group.
    pub group: String,
}

impl OrganizedMigration {
    pub fn name(&self) -> &str {
        self.migration.name()
    }
}

struct MigrationInfo {
    migration: Arc<Migration>,
    /// Index of the owning group.
    group: usize,
}

struct GroupInfo {
    line: usize,
    parent: Option<usize>,
    /// Nearest group, itself included, that declares dependencies.
    declaring: Option<usize>,
    /// Transitively owned migrations. Collection is pre-order, so these are
    /// contiguous indices into the migration table.
    members: Range<usize>,
}

enum Visit<'t> {
    Enter(&'t MigrationGroup, Option<usize>),
    Exit(usize),
}

/// Validate `graph` against the tree it was built from and order it.
pub fn organize_migrations(
    graph: &DependencyGraph,
    root: &MigrationGroup,
) -> Result<Vec<OrganizedMigration>, Vec<OrganizeError>> {
    let organizer = Organizer::new(graph, root);
    let mut errors = Vec::new();

    organizer.check_existence(&mut errors);
    organizer.check_self_references(&mut errors);

    let edges = organizer.expanded_edges();
    if let Some(cycle) = find_cycle(&organizer.migrations, &edges) {
        let line = organizer
            .migrations
            .get(&cycle[0])
            .map(|info| info.migration.start_line())
            .unwrap_or_default();
        errors.push(OrganizeError::circular(
            format!("Circular dependency detected: {}", cycle.join(" -> ")),
            cycle,
            line,
        ));
    }

    if !errors.is_empty() {
        debug!(errors = errors.len(), "organization failed validation");
        return Err(errors);
    }

    let ordered = organizer.order(&edges)?;
    info!(migrations = ordered.len(), "migrations organized");
    Ok(ordered)
}

struct Organizer<'a> {
    graph: &'a DependencyGraph,
    migrations: IndexMap<String, MigrationInfo>,
    groups: IndexMap<String, GroupInfo>,
}

impl<'a> Organizer<'a> {
    fn new(graph: &'a DependencyGraph, root: &MigrationGroup) -> Self {
        let mut organizer = Self {
            graph,
            migrations: IndexMap::new(),
            groups: IndexMap::new(),
        };
        organizer.collect(root);
        organizer
    }

    fn collect(&mut self, root: &MigrationGroup) {
        let mut stack = vec![Visit::Enter(root, None)];

        while let Some(visit) = stack.pop() {
            let (group, parent) = match visit {
                Visit::Enter(group, parent) => (group, parent),
                Visit::Exit(index) => {
                    let end = self.migrations.len();
                    if let Some((_, info)) = self.groups.get_index_mut(index) {
                        info.members.end = end;
                    }
                    continue;
                }
            };

            let group_id = match parent.and_then(|p| self.groups.get_index(p)) {
                Some((parent_id, _)) => join_id(parent_id, group.name()),
                None => group.name().to_string(),
            };
            let declares = self.graph.group(&group_id).is_some_and(|deps| !deps.is_empty());
            let inherited = parent
                .and_then(|p| self.groups.get_index(p))
                .and_then(|(_, info)| info.declaring);
            let start = self.migrations.len();
            let (index, _) = self.groups.insert_full(
                group_id.clone(),
                GroupInfo {
                    line: group.start_line(),
                    parent,
                    declaring: if declares { None } else { inherited },
                    members: start..start,
                },
            );
            if declares {
                if let Some((_, info)) = self.groups.get_index_mut(index) {
                    info.declaring = Some(index);
                }
            }

            for migration in group.migrations() {
                self.migrations.insert(
                    join_id(&group_id, migration.name()),
                    MigrationInfo {
                        migration: Arc::clone(migration),
                        group: index,
                    },
                );
            }

            stack.push(Visit::Exit(index));
            stack.extend(group.groups().iter().rev().map(|child| Visit::Enter(child, Some(index))));
        }
    }

    fn group_id(&self, index: usize) -> &str {
        self.groups.get_index(index).map(|(id, _)| id.as_str()).unwrap_or_default()
    }

    /// Strict ancestors of a group, innermost first.
    fn enclosing(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        let parent = |i: usize| self.groups.get_index(i).and_then(|(_, info)| info.parent);
        std::iter::successors(parent(index), move |i| parent(*i))
    }

    /// Groups from the owner outward that declare dependencies.
    fn declaring(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        let declaring = |i: usize| self.groups.get_index(i).and_then(|(_, info)| info.declaring);
        std::iter::successors(declaring(index), move |i| {
            self.groups
                .get_index(*i)
                .and_then(|(_, info)| info.parent)
                .and_then(declaring)
        })
    }

    fn exists(&self, id: &str) -> bool {
        self.migrations.contains_key(id) || self.groups.contains_key(id)
    }

    fn check_existence(&self, errors: &mut Vec<OrganizeError>) {
        for (id, deps) in self.graph.migrations() {
            let Some(info) = self.migrations.get(id) else {
                continue;
            };
            self.check_dependent(id, "Migration", info.migration.start_line(), deps, errors);
        }
        for (id, deps) in self.graph.groups() {
            let Some(info) = self.groups.get(id) else {
                continue;
            };
            self.check_dependent(id, "Group", info.line, deps, errors);
        }
    }

    fn check_dependent(
        &self,
        id: &str,
        kind: &str,
        line: usize,
        deps: &DependencySet,
        errors: &mut Vec<OrganizeError>,
    ) {
        for dep in &deps.migration_dependencies {
            if !self.exists(dep) {
                errors.push(OrganizeError::missing(
                    format!("{kind} {id} depends on missing migration {dep}"),
                    dep,
                    id,
                    line,
                ));
            }
        }
        for dep in &deps.group_dependencies {
            if !self.groups.contains_key(dep) {
                errors.push(OrganizeError::missing(
                    format!("{kind} {id} depends on missing group {dep}"),
                    dep,
                    id,
                    line,
                ));
            }
        }
    }

    fn check_self_references(&self, errors: &mut Vec<OrganizeError>) {
        for (id, info) in &self.migrations {
            let Some(deps) = self.graph.migration(id) else {
                continue;
            };
            let line = info.migration.start_line();

            if deps.migration_dependencies.contains(id) {
                errors.push(OrganizeError::circular(
                    format!("Migration {id} depends on itself"),
                    vec![id.clone(), id.clone()],
                    line,
                ));
            }
            let group = self.group_id(info.group);
            let own_group =
                deps.group_dependencies.contains(group) || deps.migration_dependencies.contains(group);
            if own_group {
                errors.push(OrganizeError::circular(
                    format!("Migration {id} depends on its own group {group}"),
                    vec![id.clone(), group.to_string()],
                    line,
                ));
            }
        }

        for (index, (id, info)) in self.groups.iter().enumerate() {
            let Some(deps) = self.graph.group(id) else {
                continue;
            };
            let targets = deps.group_dependencies.iter().chain(&deps.migration_dependencies);
            for dep in targets {
                let enclosing = self
                    .groups
                    .get_index_of(dep)
                    .is_some_and(|target| self.enclosing(index).any(|i| i == target));
                if dep == id {
                    errors.push(OrganizeError::circular(
                        format!("Group {id} depends on itself"),
                        vec![id.clone(), id.clone()],
                        info.line,
                    ));
                } else if enclosing {
                    errors.push(OrganizeError::circular(
                        format!("Group {id} depends on its enclosing group {dep}"),
                        vec![id.clone(), dep.clone()],
                        info.line,
                    ));
                }
            }
        }
    }

    /// Prerequisites of every migration after group expansion.
    ///
    /// Self edges are dropped; those are reported by the self-reference
    /// check instead.
    fn expanded_edges(&self) -> IndexMap<String, IndexSet<String>> {
        let mut edges = IndexMap::with_capacity(self.migrations.len());

        for (id, info) in &self.migrations {
            let mut prerequisites = IndexSet::new();

            if let Some(deps) = self.graph.migration(id) {
                self.expand(id, deps, &mut prerequisites);
            }
            for group in self.declaring(info.group) {
                if let Some(deps) = self.graph.group(self.group_id(group)) {
                    self.expand(id, deps, &mut prerequisites);
                }
            }

            edges.insert(id.clone(), prerequisites);
        }
        edges
    }

    fn expand(&self, id: &str, deps: &DependencySet, into: &mut IndexSet<String>) {
        for dep in &deps.migration_dependencies {
            if self.migrations.contains_key(dep) {
                if dep != id {
                    into.insert(dep.clone());
                }
            } else {
                self.expand_group(id, dep, into);
            }
        }
        for dep in &deps.group_dependencies {
            self.expand_group(id, dep, into);
        }
    }

    fn expand_group(&self, id: &str, group: &str, into: &mut IndexSet<String>) {
        let Some(info) = self.groups.get(group) else {
            return;
        };
        for index in info.members.clone() {
            if let Some((member, _)) = self.migrations.get_index(index) {
                if member != id {
                    into.insert(member.clone());
                }
            }
        }
    }

    /// Kahn's algorithm. Ready nodes leave the queue in arrival order, and
    /// the initial queue follows tree order.
    fn order(
        &self,
        edges: &IndexMap<String, IndexSet<String>>,
    ) -> Result<Vec<OrganizedMigration>, Vec<OrganizeError>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(edges.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::with_capacity(edges.len());

        for (id, prerequisites) in edges {
            in_degree.insert(id, prerequisites.len());
            for prerequisite in prerequisites {
                dependents.entry(prerequisite.as_str()).or_default().push(id);
            }
        }

        let mut queue: VecDeque<&str> = edges
            .iter()
            .filter(|(_, prerequisites)| prerequisites.is_empty())
            .map(|(id, _)| id.as_str())
            .collect();

        let mut ordered = Vec::with_capacity(edges.len());
        while let Some(current) = queue.pop_front() {
            if let Some(info) = self.migrations.get(current) {
                ordered.push(OrganizedMigration {
                    id: current.to_string(),
                    migration: Arc::clone(&info.migration),
                    group: self.group_id(info.group).to_string(),
                });
            }
            for dependent in dependents.get(current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if ordered.len() == self.migrations.len() {
            return Ok(ordered);
        }

        let stranded: Vec<String> = self
            .migrations
            .keys()
            .filter(|id| in_degree.get(id.as_str()).is_some_and(|degree| *degree > 0))
            .cloned()
            .collect();
        Err(vec![OrganizeError::circular(
            format!(
                "Circular dependency detected among migrations: {}",
                stranded.join(", ")
            ),
            stranded,
            0,
        )])
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Three-color depth-first search over an explicit path stack. Returns the
/// first cycle found, closed by repeating its first node.
fn find_cycle(
    migrations: &IndexMap<String, MigrationInfo>,
    edges: &IndexMap<String, IndexSet<String>>,
) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(migrations.len());
    // Each entry is a node and the index of its next prerequisite to visit.
    let mut path: Vec<(&str, usize)> = Vec::new();

    for start in migrations.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        marks.insert(start, Mark::OnPath);
        path.push((start, 0));

        while let Some((node, next)) = path.last_mut() {
            let node: &str = *node;
            let prerequisite = edges.get(node).and_then(|p| p.get_index(*next));
            *next += 1;

            let Some(prerequisite) = prerequisite else {
                marks.insert(node, Mark::Done);
                path.pop();
                continue;
            };

            match marks.get(prerequisite.as_str()).copied() {
                Some(Mark::Done) => {}
                Some(Mark::OnPath) => {
                    let from = path
                        .iter()
                        .position(|(n, _)| *n == prerequisite.as_str())
                        .unwrap_or_default();
                    let mut cycle: Vec<String> = path[from..].iter().map(|(n, _)| n.to_string()).collect();
                    cycle.push(prerequisite.clone());
                    return Some(cycle);
                }
                None => {
                    marks.insert(prerequisite, Mark::OnPath);
                    path.push((prerequisite, 0));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{SourceFile, parse_sources};
    use pretty_assertions::assert_eq;

    fn organize(files: &[(&str, &str)]) -> Result<Vec<OrganizedMigration>, Vec<OrganizeError>> {
        let files: Vec<SourceFile> = files.iter().map(|(p, c)| SourceFile::new(*p, *c)).collect();
        let root = parse_sources(&files).unwrap();
        let graph = DependencyGraph::build(&root);
        organize_migrations(&graph, &root)
    }

    fn migration(name: &str, deps: &[&str]) -> String {
        let mut block = format!("-- +migration: {name}\n");
        for dep in deps {
            block.push_str(&format!("-- +dependency: {dep}\n"));
        }
        block.push_str("SELECT 1;\n-- +endmigration\n");
        block
    }

    fn names(ordered: &[OrganizedMigration]) -> Vec<&str> {
        ordered.iter().map(OrganizedMigration::name).collect()
    }

    fn position(ordered: &[OrganizedMigration], name: &str) -> usize {
        ordered.iter().position(|m| m.name() == name).unwrap()
    }

    #[test]
    fn test_independent_migrations_keep_tree_order() {
        let content = [migration("a", &[]), migration("b", &[]), migration("c", &[])].concat();
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(names(&ordered), vec!["a", "b", "c"]);
        assert_eq!(ordered[0].id, "root::m/001-a.sql::a");
        assert_eq!(ordered[0].group, "root::m/001-a.sql");
    }

    #[test]
    fn test_dependencies_come_first() {
        let content = [
            migration("c", &["b"]),
            migration("b", &["a"]),
            migration("a", &[]),
            migration("d", &["a", "c"]),
        ]
        .concat();
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(ordered.len(), 4);
        assert_eq!(names(&ordered), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cross_file_dependency() {
        let first = migration("users", &["::./002-roles.sql::roles"]);
        let second = migration("roles", &[]);
        let ordered = organize(&[("m/001-users.sql", &first), ("m/002-roles.sql", &second)]).unwrap();
        assert!(position(&ordered, "roles") < position(&ordered, "users"));
    }

    #[test]
    fn test_group_dependency_expands_to_members() {
        let content = format!(
            "{}-- +group: setup\n{}{}-- +group: inner\n{}-- +endgroup\n-- +endgroup\n",
            "-- +migration: app\n-- +groupdependency: setup\nSELECT 1;\n-- +endmigration\n",
            migration("s1", &[]),
            migration("s2", &[]),
            migration("s3", &[]),
        );
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        let app = position(&ordered, "app");
        for member in ["s1", "s2", "s3"] {
            assert!(position(&ordered, member) < app, "{member} should precede app");
        }
    }

    #[test]
    fn test_group_level_dependency_cascades() {
        let content = format!(
            "-- +group: later\n-- +dependency: base\n{}{}-- +endgroup\n{}",
            migration("l1", &[]),
            migration("l2", &[]),
            migration("base", &[]),
        );
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(names(&ordered), vec!["base", "l1", "l2"]);
    }

    #[test]
    fn test_file_level_group_dependency() {
        let first = format!("-- +groupdependency: ::./002-b.sql\n{}", migration("a", &[]));
        let second = migration("b", &[]);
        let ordered = organize(&[("m/001-a.sql", &first), ("m/002-b.sql", &second)]).unwrap();
        assert_eq!(names(&ordered), vec!["b", "a"]);
    }

    #[test]
    fn test_missing_dependency() {
        let content = migration("a", &["ghost"]);
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            OrganizeError::Missing {
                dependency,
                dependent_id,
                line,
                ..
            } => {
                assert_eq!(dependency, "ghost");
                assert_eq!(dependent_id, "root::m/001-a.sql::a");
                assert_eq!(*line, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_group_dependency() {
        let content = "-- +migration: a\n-- +groupdependency: nowhere\nSELECT 1;\n-- +endmigration";
        let errors = organize(&[("m/001-a.sql", content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_missing());
        assert!(errors[0].message().contains("missing group nowhere"));
    }

    #[test]
    fn test_self_dependency() {
        let content = migration("a", &["a"]);
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            OrganizeError::Circular { cycle, .. } => {
                assert_eq!(cycle, &vec!["root::m/001-a.sql::a".to_string(); 2]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_own_group_dependency() {
        let content =
            "-- +group: g\n-- +migration: a\n-- +groupdependency: g\nSELECT 1;\n-- +endmigration\n-- +endgroup\n";
        let errors = organize(&[("m/001-a.sql", content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_circular());
        assert!(errors[0].message().contains("its own group root::m/001-a.sql::g"));
    }

    #[test]
    fn test_two_cycle_reported_once() {
        let content = [migration("a", &["b"]), migration("b", &["a"])].concat();
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            OrganizeError::Circular { cycle, line, .. } => {
                assert!(cycle.contains(&"root::m/001-a.sql::a".to_string()));
                assert!(cycle.contains(&"root::m/001-a.sql::b".to_string()));
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(*line, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_group_cascaded_cycle() {
        let content = format!(
            "-- +group: g\n{}-- +endgroup\n{}",
            migration("inside", &["outside"]),
            "-- +migration: outside\n-- +groupdependency: g\nSELECT 1;\n-- +endmigration\n",
        );
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().starts_with("Circular dependency detected:"));
    }

    #[test]
    fn test_group_depending_on_enclosing_group() {
        let content = format!(
            "-- +group: outer\n-- +group: inner\n-- +groupdependency: outer\n{}-- +endgroup\n-- +endgroup\n",
            migration("a", &[]),
        );
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| e.message().contains("depends on its enclosing group root::m/001-a.sql::outer"))
        );
    }

    #[test]
    fn test_all_errors_are_collected() {
        let content = [
            migration("a", &["missing_one"]),
            migration("b", &["missing_two"]),
            migration("c", &["c"]),
        ]
        .concat();
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert_eq!(errors.iter().filter(|e| e.is_missing()).count(), 2);
        assert_eq!(errors.iter().filter(|e| e.is_circular()).count(), 1);
    }

    #[test]
    fn test_migration_dependency_on_group_name() {
        let content = format!(
            "{}-- +group: seed\n{}-- +endgroup\n",
            migration("report", &["seed"]),
            migration("rows", &[]),
        );
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(names(&ordered), vec!["rows", "report"]);
    }

    #[test]
    fn test_order_shares_parsed_migrations() {
        let files = vec![SourceFile::new("m/001-a.sql", migration("a", &[]))];
        let root = parse_sources(&files).unwrap();
        let graph = DependencyGraph::build(&root);
        let ordered = organize_migrations(&graph, &root).unwrap();
        assert!(Arc::ptr_eq(
            &ordered[0].migration,
            &root.groups()[0].migrations()[0]
        ));
    }

    #[test]
    fn test_cascade_skips_groups_without_dependencies() {
        let content = format!(
            "-- +group: outer\n-- +groupdependency: setup\n-- +group: middle\n-- +group: inner\n{}\
             -- +endgroup\n-- +endgroup\n-- +endgroup\n-- +group: setup\n{}-- +endgroup\n",
            migration("leaf", &[]),
            migration("init", &[]),
        );
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(names(&ordered), vec!["init", "leaf"]);
        assert_eq!(ordered[1].group, "root::m/001-a.sql::outer::middle::inner");
    }

    #[test]
    fn test_deeply_nested_groups() {
        const DEPTH: usize = 2_000;
        let content = format!(
            "{}{}{}{}",
            migration("base", &[]),
            "-- +group: g\n".repeat(DEPTH),
            migration("leaf", &["base"]),
            "-- +endgroup\n".repeat(DEPTH),
        );
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(names(&ordered), vec!["base", "leaf"]);
        assert_eq!(ordered[1].group.matches("::g").count(), DEPTH);
    }

    #[test]
    fn test_long_chain_declared_in_reverse() {
        const LENGTH: usize = 20_000;
        let content: String = (0..LENGTH)
            .map(|i| {
                if i + 1 < LENGTH {
                    migration(&format!("m{i}"), &[&format!("m{}", i + 1)])
                } else {
                    migration(&format!("m{i}"), &[])
                }
            })
            .collect();
        let ordered = organize(&[("m/001-a.sql", &content)]).unwrap();
        assert_eq!(ordered.len(), LENGTH);
        assert_eq!(ordered[0].name(), format!("m{}", LENGTH - 1));
        assert_eq!(ordered[LENGTH - 1].name(), "m0");
    }

    #[test]
    fn test_long_cycle_is_found() {
        const LENGTH: usize = 20_000;
        let content: String = (0..LENGTH)
            .map(|i| migration(&format!("m{i}"), &[&format!("m{}", (i + 1) % LENGTH)]))
            .collect();
        let errors = organize(&[("m/001-a.sql", &content)]).unwrap_err();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            OrganizeError::Circular { cycle, .. } => assert_eq!(cycle.len(), LENGTH + 1),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
