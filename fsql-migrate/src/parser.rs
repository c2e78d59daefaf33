//! Directive parser.
//!
//! Turns annotated SQL text into a [`MigrationGroup`] tree. Input is
//! processed one trimmed line at a time; every non-blank line is classified
//! as exactly one [`Directive`] (first match wins) and applied to an explicit
//! stack of open groups plus at most one open migration.
//!
//! ```sql
//! -- +group: accounts
//! -- +migration: create_users
//! --+ Creates the users table
//! -- +tags: transactional
//! CREATE TABLE users (id SERIAL PRIMARY KEY);
//! -- +endmigration
//! -- +endgroup
//! ```

use std::sync::{Arc, LazyLock};

use indexmap::IndexSet;
use regex_lite::Regex;
use tracing::{debug, trace};

use crate::error::{ParseError, ParseResult};
use crate::model::{GroupTag, Migration, MigrationGroup, MigrationTag, ROOT_GROUP_NAME, is_valid_name};

/// Path recorded for content that did not come from a file.
pub const IN_MEMORY_PATH: &str = "in-memory";

fn directive(pattern: &str) -> Regex {
    Regex::new(pattern).expect("directive pattern is valid")
}

static MIGRATION_START: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+migration:\s*(.*)$"));
static MIGRATION_END: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+endmigration(?:\s|$)"));
static GROUP_START: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+group:\s*(.*)$"));
static GROUP_END: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+endgroup(?:\s|$)"));
static TAGS: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+tags:\s*(.*)$"));
static DEPENDENCY: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+dependency:\s*(.*)$"));
static GROUP_DEPENDENCY: LazyLock<Regex> =
    LazyLock::new(|| directive(r"^--\s*\+groupdependency:\s*(.*)$"));
static DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| directive(r"^--\s*\+(.*)$"));

/// A source file handed to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Classification of a single trimmed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    MigrationStart(&'a str),
    MigrationEnd,
    GroupStart(&'a str),
    GroupEnd,
    Tags(&'a str),
    Dependency(&'a str),
    GroupDependency(&'a str),
    Description(&'a str),
    Sql(&'a str),
}

impl<'a> Directive<'a> {
    /// Classify a trimmed line. Patterns are tried in priority order.
    pub fn classify(line: &'a str) -> Self {
        if let Some(name) = capture(&MIGRATION_START, line) {
            Self::MigrationStart(name)
        } else if MIGRATION_END.is_match(line) {
            Self::MigrationEnd
        } else if let Some(name) = capture(&GROUP_START, line) {
            Self::GroupStart(name)
        } else if GROUP_END.is_match(line) {
            Self::GroupEnd
        } else if let Some(value) = capture(&TAGS, line) {
            Self::Tags(value)
        } else if let Some(value) = capture(&DEPENDENCY, line) {
            Self::Dependency(value)
        } else if let Some(value) = capture(&GROUP_DEPENDENCY, line) {
            Self::GroupDependency(value)
        } else if let Some(text) = capture(&DESCRIPTION, line) {
            Self::Description(text)
        } else {
            Self::Sql(line)
        }
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

/// Split a directive value on commas and whitespace.
fn split_values(value: &str) -> Vec<&str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .collect()
}

/// The first whitespace-delimited token of a start directive.
fn directive_name(value: &str) -> &str {
    value.split_whitespace().next().unwrap_or_default()
}

/// Names already closed in one scope.
#[derive(Default)]
struct ScopeNames {
    migrations: IndexSet<String>,
    groups: IndexSet<String>,
}

struct FileParser<'a> {
    file: &'a str,
    root: MigrationGroup,
    root_names: ScopeNames,
    open_groups: Vec<MigrationGroup>,
    /// Parallel to `open_groups`.
    open_names: Vec<ScopeNames>,
    open_migration: Option<Migration>,
    migration_count: usize,
}

impl<'a> FileParser<'a> {
    fn new(file: &'a str, serial: usize) -> Self {
        Self {
            file,
            root: MigrationGroup::new(file, serial, 1),
            root_names: ScopeNames::default(),
            open_groups: Vec::new(),
            open_names: Vec::new(),
            open_migration: None,
            migration_count: 0,
        }
    }

    /// The innermost open group, or the file root.
    fn scope(&mut self) -> &mut MigrationGroup {
        self.open_groups.last_mut().unwrap_or(&mut self.root)
    }

    fn scope_names(&mut self) -> &mut ScopeNames {
        self.open_names.last_mut().unwrap_or(&mut self.root_names)
    }

    fn consume(&mut self, line: usize, text: &str) -> ParseResult<()> {
        match Directive::classify(text) {
            Directive::MigrationStart(value) => self.start_migration(line, directive_name(value)),
            Directive::MigrationEnd => self.end_migration(line),
            Directive::GroupStart(value) => self.start_group(line, directive_name(value)),
            Directive::GroupEnd => self.end_group(line),
            Directive::Tags(value) => self.tags(line, value),
            Directive::Dependency(value) => self.dependency(line, value),
            Directive::GroupDependency(value) => {
                let values = split_values(value);
                if let Some(migration) = self.open_migration.as_mut() {
                    add_each(&values, |v| migration.add_group_dependency(v));
                } else {
                    let scope = self.scope();
                    add_each(&values, |v| scope.add_group_dependency(v));
                }
                Ok(())
            }
            Directive::Description(text) => {
                if let Some(migration) = self.open_migration.as_mut() {
                    migration.add_to_description(text);
                } else {
                    self.scope().add_to_description(text);
                }
                Ok(())
            }
            Directive::Sql(sql) => {
                match self.open_migration.as_mut() {
                    Some(migration) => migration.add_to_sql(sql),
                    None => debug!(file = %self.file, line, "ignoring SQL outside of a migration"),
                }
                Ok(())
            }
        }
    }

    fn start_migration(&mut self, line: usize, name: &str) -> ParseResult<()> {
        if self.open_migration.is_some() {
            return Err(ParseError::NestedMigration {
                name: name.to_string(),
                file: self.file.to_string(),
                line,
            });
        }
        self.check_name("migration", name, line)?;

        self.migration_count += 1;
        trace!(file = %self.file, line, migration = name, "migration opened");
        self.open_migration = Some(Migration::new(self.file, name, self.migration_count, "", line));
        Ok(())
    }

    fn end_migration(&mut self, line: usize) -> ParseResult<()> {
        let Some(mut migration) = self.open_migration.take() else {
            return Err(ParseError::UnexpectedEndMigration {
                file: self.file.to_string(),
                line,
            });
        };
        migration.close(line);

        let file = self.file;
        let fresh = self.scope_names().migrations.insert(migration.name().to_string());
        let scope = self.scope();
        if !fresh {
            return Err(ParseError::DuplicateMigration {
                name: migration.name().to_string(),
                scope: scope.name().to_string(),
                file: file.to_string(),
                line: migration.start_line(),
            });
        }
        trace!(file = %file, line, migration = migration.name(), "migration closed");
        scope.add_migration(Arc::new(migration));
        Ok(())
    }

    fn start_group(&mut self, line: usize, name: &str) -> ParseResult<()> {
        if let Some(migration) = &self.open_migration {
            return Err(ParseError::GroupInsideMigration {
                name: name.to_string(),
                migration: migration.name().to_string(),
                file: self.file.to_string(),
                line,
            });
        }
        self.check_name("group", name, line)?;

        let serial = self.scope().groups().len() + 1;
        self.open_groups.push(MigrationGroup::new(name, serial, line));
        self.open_names.push(ScopeNames::default());
        Ok(())
    }

    fn end_group(&mut self, line: usize) -> ParseResult<()> {
        if let Some(migration) = &self.open_migration {
            let group = self
                .open_groups
                .last()
                .map(|g| g.name().to_string())
                .unwrap_or_default();
            return Err(ParseError::GroupClosedOverMigration {
                group,
                migration: migration.name().to_string(),
                file: self.file.to_string(),
                line,
            });
        }
        let Some(mut group) = self.open_groups.pop() else {
            return Err(ParseError::UnexpectedEndGroup {
                file: self.file.to_string(),
                line,
            });
        };
        group.close(line);
        self.open_names.pop();

        let file = self.file;
        let fresh = self.scope_names().groups.insert(group.name().to_string());
        let parent = self.scope();
        if !fresh {
            return Err(ParseError::DuplicateGroup {
                name: group.name().to_string(),
                scope: parent.name().to_string(),
                file: file.to_string(),
                line: group.start_line(),
            });
        }
        parent.add_group(group);
        Ok(())
    }

    fn tags(&mut self, line: usize, value: &str) -> ParseResult<()> {
        let names = split_values(value);
        let file = self.file;
        let unknown = |tag: &str| ParseError::UnknownTag {
            tag: tag.to_string(),
            file: file.to_string(),
            line,
        };

        if let Some(migration) = self.open_migration.as_mut() {
            let tags = names
                .iter()
                .map(|name| MigrationTag::from_name(name).ok_or_else(|| unknown(name)))
                .collect::<ParseResult<Vec<_>>>()?;
            migration.add_tags(&tags);
        } else if let Some(group) = self.open_groups.last_mut() {
            let tags = names
                .iter()
                .map(|name| GroupTag::from_name(name).ok_or_else(|| unknown(name)))
                .collect::<ParseResult<Vec<_>>>()?;
            group.add_tags(&tags);
        } else {
            return Err(self.without_scope("tags", line));
        }
        Ok(())
    }

    fn dependency(&mut self, line: usize, value: &str) -> ParseResult<()> {
        let values = split_values(value);
        if let Some(migration) = self.open_migration.as_mut() {
            add_each(&values, |v| migration.add_migration_dependency(v));
        } else if let Some(group) = self.open_groups.last_mut() {
            add_each(&values, |v| group.add_migration_dependency(v));
        } else {
            return Err(self.without_scope("dependency", line));
        }
        Ok(())
    }

    fn check_name(&self, kind: &'static str, name: &str, line: usize) -> ParseResult<()> {
        if is_valid_name(name) {
            Ok(())
        } else {
            Err(ParseError::InvalidName {
                kind,
                name: name.to_string(),
                file: self.file.to_string(),
                line,
            })
        }
    }

    fn without_scope(&self, directive: &str, line: usize) -> ParseError {
        ParseError::DirectiveWithoutScope {
            directive: directive.to_string(),
            file: self.file.to_string(),
            line,
        }
    }

    fn finish(mut self, last_line: usize) -> ParseResult<MigrationGroup> {
        if let Some(migration) = self.open_migration {
            return Err(ParseError::UnclosedMigration {
                name: migration.name().to_string(),
                file: self.file.to_string(),
                line: migration.start_line(),
            });
        }
        if let Some(group) = self.open_groups.pop() {
            return Err(ParseError::UnclosedGroup {
                name: group.name().to_string(),
                file: self.file.to_string(),
                line: group.start_line(),
            });
        }
        self.root.close(last_line);
        Ok(self.root)
    }
}

/// Apply `add` to each value, or once with an empty value so the model can
/// report the no-op.
fn add_each(values: &[&str], mut add: impl FnMut(&str)) {
    if values.is_empty() {
        add("");
    }
    for value in values {
        add(value);
    }
}

/// Parse one file into its file root group.
///
/// `serial` is the position of the file among all parsed files.
pub fn parse_file(file: &SourceFile, serial: usize) -> ParseResult<MigrationGroup> {
    let mut parser = FileParser::new(&file.path, serial);
    let mut last_line = 1;

    for (index, raw) in file.content.lines().enumerate() {
        last_line = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        parser.consume(index + 1, line)?;
    }

    let root = parser.finish(last_line)?;
    debug!(
        file = %file.path,
        migrations = root.migration_count(),
        groups = root.groups().len(),
        "parsed file"
    );
    Ok(root)
}

/// Parse a content string into a file root group named `file_path`.
pub fn parse_content(content: &str, file_path: &str) -> ParseResult<MigrationGroup> {
    parse_file(&SourceFile::new(file_path, content), 1)
}

/// Parse several files and nest their roots under the global root group.
pub fn parse_sources(files: &[SourceFile]) -> ParseResult<MigrationGroup> {
    let roots = files
        .iter()
        .enumerate()
        .map(|(index, file)| parse_file(file, index + 1))
        .collect::<ParseResult<Vec<_>>>()?;
    merge_roots(roots)
}

/// Parse files concurrently on the blocking pool.
///
/// Results are merged in input order regardless of completion order, and
/// the first failing file in input order determines the returned error.
pub async fn parse_files(files: Vec<SourceFile>) -> ParseResult<MigrationGroup> {
    let tasks: Vec<_> = files
        .into_iter()
        .enumerate()
        .map(|(index, file)| {
            let path = file.path.clone();
            let handle = tokio::task::spawn_blocking(move || parse_file(&file, index + 1));
            (path, handle)
        })
        .collect();

    let mut roots = Vec::with_capacity(tasks.len());
    for (path, handle) in tasks {
        let root = handle.await.map_err(|e| ParseError::TaskFailed {
            file: path,
            message: e.to_string(),
        })??;
        roots.push(root);
    }
    merge_roots(roots)
}

fn merge_roots(roots: Vec<MigrationGroup>) -> ParseResult<MigrationGroup> {
    let mut global = MigrationGroup::root();
    let mut seen = IndexSet::with_capacity(roots.len());
    for root in roots {
        if !seen.insert(root.name().to_string()) {
            return Err(ParseError::DuplicateGroup {
                name: root.name().to_string(),
                scope: ROOT_GROUP_NAME.to_string(),
                file: root.name().to_string(),
                line: 1,
            });
        }
        global.add_group(root);
    }
    Ok(global)
}
