//! Statement splitter for migration files.
//!
//! Migration files hold several statements separated by `;`.  Routine
//! definitions carry semicolons inside their bodies, so they are lifted out
//! first and replaced by placeholder tokens:
//!
//! * `CREATE [OR REPLACE] FUNCTION|TRIGGER|PROCEDURE` whose body opens with a
//!   dollar quote (`$$` or `$tag$`) before the first `;`, through the closing
//!   tag and the next `;`.
//! * `CREATE TRIGGER ... BEGIN ... END;` blocks (SQLite).
//!
//! The remainder is split on `;` outside quotes, dollar quotes and comments,
//! fragments holding only whitespace or comments are dropped, and the
//! placeholders are restored.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static ROUTINE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bCREATE\s+(?:OR\s+REPLACE\s+)?(?:CONSTRAINT\s+)?(?:TEMP(?:ORARY)?\s+)?(FUNCTION|TRIGGER|PROCEDURE)\b",
    )
    .expect("routine pattern")
});

static DOLLAR_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[A-Za-z_][A-Za-z0-9_]*\$|\$\$").expect("dollar tag pattern"));

static BEGIN_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bBEGIN\b").expect("begin pattern"));

static BLOCK_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(BEGIN|CASE|END)\b").expect("block word pattern"));

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__KEEL_ROUTINE_(\d+)__").expect("placeholder pattern"));

/// Lexical class of each byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Code,
    /// Inside a quoted string, quoted identifier or dollar-quoted body.
    Literal,
    Comment,
}

/// Split a migration file into executable statements, without trailing `;`.
pub fn split_statements(sql: &str) -> Vec<String> {
    let (rewritten, routines) = extract_routines(sql);
    let classes = classify(&rewritten);
    let bytes = rewritten.as_bytes();

    let mut statements = Vec::new();
    let mut start = 0;
    for i in 0..=bytes.len() {
        let boundary = i == bytes.len() || (bytes[i] == b';' && classes[i] == Class::Code);
        if !boundary {
            continue;
        }
        if has_content(&bytes[start..i], &classes[start..i]) {
            statements.push(restore(rewritten[start..i].trim(), &routines));
        }
        start = i + 1;
    }
    statements
}

/// Replace routine blocks with placeholder tokens.  The terminating `;` of
/// each block stays in the rewritten text.
fn extract_routines(sql: &str) -> (String, Vec<String>) {
    let classes = classify(sql);
    let bytes = sql.as_bytes();
    let mut rewritten = String::with_capacity(sql.len());
    let mut routines = Vec::new();
    let mut cursor = 0;

    for caps in ROUTINE_START.captures_iter(sql) {
        let Some(whole) = caps.get(0) else { continue };
        let start = whole.start();
        if start < cursor || classes[start] != Class::Code {
            continue;
        }
        let first_semi = next_code_semicolon(bytes, &classes, whole.end());

        let dollar_body = (whole.end()..first_semi).any(|j| {
            bytes[j] == b'$' && classes[j] == Class::Literal && classes[j - 1] != Class::Literal
        });
        let end = if dollar_body {
            Some(first_semi)
        } else if caps[1].eq_ignore_ascii_case("TRIGGER") {
            trigger_block_end(sql, &classes, whole.end(), first_semi)
        } else {
            None
        };

        if let Some(end) = end {
            rewritten.push_str(&sql[cursor..start]);
            rewritten.push_str(&format!("__KEEL_ROUTINE_{}__", routines.len()));
            routines.push(sql[start..end].trim_end().to_string());
            cursor = end;
        }
    }

    rewritten.push_str(&sql[cursor..]);
    (rewritten, routines)
}

/// End (position of the closing `;`) of a `BEGIN ... END;` trigger body, if
/// a code-level `BEGIN` opens before the first `;`.  `CASE ... END` pairs
/// inside the body are nested, so only the `END` that closes the outer
/// `BEGIN` finishes the block.
fn trigger_block_end(sql: &str, classes: &[Class], from: usize, first_semi: usize) -> Option<usize> {
    let begin = BEGIN_WORD
        .find_iter(&sql[from..first_semi])
        .map(|m| from + m.start())
        .find(|&pos| classes[pos] == Class::Code)?;

    let mut depth = 0usize;
    for word in BLOCK_WORD.find_iter(&sql[begin..]) {
        let pos = begin + word.start();
        if classes[pos] != Class::Code {
            continue;
        }
        if word.as_str().eq_ignore_ascii_case("END") {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(next_code_semicolon(sql.as_bytes(), classes, begin + word.end()));
            }
        } else {
            depth += 1;
        }
    }
    None
}

fn next_code_semicolon(bytes: &[u8], classes: &[Class], from: usize) -> usize {
    (from..bytes.len())
        .find(|&i| bytes[i] == b';' && classes[i] == Class::Code)
        .unwrap_or(bytes.len())
}

fn has_content(bytes: &[u8], classes: &[Class]) -> bool {
    bytes
        .iter()
        .zip(classes)
        .any(|(b, class)| *class != Class::Comment && !b.is_ascii_whitespace())
}

fn restore(fragment: &str, routines: &[String]) -> String {
    PLACEHOLDER
        .replace_all(fragment, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| routines.get(n))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Classify every byte as code, literal or comment.
fn classify(sql: &str) -> Vec<Class> {
    let bytes = sql.as_bytes();
    let mut classes = vec![Class::Code; bytes.len()];
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // doubled quote is an escape
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                classes[start..i].fill(Class::Literal);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                classes[start..i].fill(Class::Comment);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                classes[start..i].fill(Class::Comment);
            }
            b'$' if i == 0 || !is_ident_byte(bytes[i - 1]) => {
                match DOLLAR_TAG.find_at(sql, i).filter(|m| m.start() == i) {
                    Some(tag) => {
                        let tag = tag.as_str();
                        let body = i + tag.len();
                        i = sql[body..]
                            .find(tag)
                            .map_or(bytes.len(), |p| body + p + tag.len());
                        classes[start..i].fill(Class::Literal);
                    }
                    None => i += 1,
                }
            }
            _ => i += 1,
        }
    }
    classes
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_statements() {
        let stmts = split_statements(
            "CREATE TABLE a (id INTEGER);\n\nINSERT INTO a VALUES (1);\n",
        );
        assert_eq!(
            stmts,
            vec!["CREATE TABLE a (id INTEGER)", "INSERT INTO a VALUES (1)"]
        );
    }

    #[test]
    fn semicolons_in_strings_and_comments_are_ignored() {
        let stmts = split_statements(
            "-- setup; nothing here\nINSERT INTO t VALUES ('a;b', \"c;d\");\n/* x; y */\n",
        );
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].ends_with("('a;b', \"c;d\")"));
    }

    #[test]
    fn comment_only_fragments_are_dropped() {
        let stmts = split_statements("-- just a note\n;\n  ;\n/* block */");
        assert!(stmts.is_empty());
    }

    #[test]
    fn dollar_quoted_function_is_one_statement() {
        let sql = "CREATE OR REPLACE FUNCTION touch() RETURNS trigger AS $$\n\
                   BEGIN\n  NEW.updated_at = now();\n  RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql;\n\
                   CREATE TABLE t (id INT);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE OR REPLACE FUNCTION touch()"));
        assert!(stmts[0].contains("RETURN NEW;"));
        assert!(stmts[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(stmts[1], "CREATE TABLE t (id INT)");
    }

    #[test]
    fn tagged_dollar_quotes() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; $body$ LANGUAGE sql;\
                   SELECT 2;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("$body$ SELECT 1; $body$"));
    }

    #[test]
    fn sqlite_trigger_body_is_one_statement() {
        let sql = "CREATE TRIGGER stamp AFTER UPDATE ON t\nBEGIN\n  \
                   UPDATE t SET n = n + 1 WHERE id = NEW.id;\n  \
                   INSERT INTO log VALUES (NEW.id);\nEND;\nCREATE INDEX i ON t(id);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TRIGGER stamp"));
        assert!(stmts[0].ends_with("END"));
        assert_eq!(stmts[1], "CREATE INDEX i ON t(id)");
    }

    #[test]
    fn case_expressions_inside_trigger_bodies_do_not_end_the_block() {
        let sql = "CREATE TRIGGER t AFTER INSERT ON x BEGIN \
                   UPDATE x SET n = CASE WHEN NEW.v > 0 THEN 1 ELSE 2 END; \
                   INSERT INTO log VALUES (1); END; SELECT 1;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2, "{stmts:#?}");
        assert!(stmts[0].contains("ELSE 2 END; INSERT INTO log VALUES (1); END"));
        assert!(stmts[0].ends_with("END"));
        assert_eq!(stmts[1], "SELECT 1");
    }

    #[test]
    fn nested_case_and_end_in_literals_are_tracked() {
        let sql = "CREATE TRIGGER t AFTER UPDATE ON x\nBEGIN\n  \
                   UPDATE x SET label = CASE WHEN NEW.v > 0 \
                   THEN CASE WHEN NEW.v > 9 THEN 'big END;' ELSE 'small' END \
                   ELSE 'none' END WHERE id = NEW.id;\nEND;\nCREATE INDEX i ON x(id);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2, "{stmts:#?}");
        assert!(stmts[0].ends_with("WHERE id = NEW.id;\nEND"));
        assert_eq!(stmts[1], "CREATE INDEX i ON x(id)");
    }

    #[test]
    fn postgres_trigger_without_body_splits_normally() {
        let sql = "CREATE TRIGGER t_touch BEFORE UPDATE ON t FOR EACH ROW EXECUTE FUNCTION touch();\
                   SELECT 1;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("EXECUTE FUNCTION touch()"));
    }

    #[test]
    fn do_blocks_keep_inner_semicolons() {
        let stmts = split_statements("DO $$ BEGIN PERFORM 1; END $$;\nSELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "DO $$ BEGIN PERFORM 1; END $$");
    }

    #[test]
    fn positional_parameters_are_not_dollar_quotes() {
        let stmts = split_statements("UPDATE t SET a = $1 WHERE b = $2; SELECT 1;");
        assert_eq!(stmts.len(), 2);
    }
}
