// Minimal literal-SQL dialect for the `trans` table.
//
// Domain statements reach the coordinator as opaque strings with inline
// literals; the in-memory backend interprets just the shapes the system
// actually produces and replays:
//
//   INSERT INTO trans (c1, c2, ...) VALUES (v1, v2, ...)
//   UPDATE trans SET c1 = v1[, ...] WHERE trans_id = N
//   DELETE FROM trans WHERE trans_id = N
//   SELECT ... FROM trans [WHERE trans_id = N] [ORDER BY ...] [LIMIT n]
//   SELECT MAX(trans_id) ... FROM trans
//
// Keywords are matched case-insensitively; string literals use single quotes
// with `''` as the escape. Column projections are not narrowed: selects
// return full rows. Anything outside these shapes is rejected by the caller
// as invalid input.

use crate::types::Value;

/// A parsed `trans`-table statement.
#[derive(Debug, Clone, PartialEq)]
pub enum TransStatement {
    Insert {
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        sets: Vec<(String, Value)>,
        trans_id: i64,
    },
    Delete {
        trans_id: i64,
    },
    Select(SelectSpec),
}

/// Shape of a supported SELECT against `trans`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectSpec {
    /// Point lookup key, when a `WHERE trans_id = N` clause is present.
    pub trans_id: Option<i64>,
    /// Row cap from a trailing `LIMIT n`.
    pub limit: Option<usize>,
    /// True for the `MAX(trans_id)` aggregate.
    pub max_id: bool,
}

/// Parses a `trans`-table statement, or returns `None` for unsupported SQL.
pub fn parse(sql: &str) -> Option<TransStatement> {
    let s = normalize(sql);
    let u = s.to_ascii_uppercase();
    if u.starts_with("INSERT INTO TRANS ") || u.starts_with("INSERT INTO TRANS(") {
        parse_insert(&s)
    } else if u.starts_with("UPDATE TRANS SET ") {
        parse_update(&s)
    } else if u.starts_with("DELETE FROM TRANS WHERE ") {
        parse_delete(&s)
    } else if u.starts_with("SELECT ") && has_from_trans(&s) {
        parse_select(&s, &u)
    } else {
        None
    }
}

/// Collapses whitespace outside string literals and strips a trailing `;`.
fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_quote = false;
    let mut last_space = false;
    for c in sql.trim().chars() {
        if in_quote {
            out.push(c);
            if c == '\'' {
                in_quote = false;
            }
        } else if c == '\'' {
            in_quote = true;
            last_space = false;
            out.push(c);
        } else if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(c);
            last_space = false;
        }
    }
    let mut s = out.trim().to_string();
    if s.ends_with(';') {
        s.pop();
        while s.ends_with(' ') {
            s.pop();
        }
    }
    s
}

/// Finds `needle` (ASCII, case-insensitive) outside string literals.
fn find_top_level_ci(s: &str, needle: &str) -> Option<usize> {
    let sb = s.as_bytes();
    let nb = needle.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < sb.len() {
        let c = sb[i];
        if in_quote {
            if c == b'\'' {
                in_quote = false;
            }
            i += 1;
            continue;
        }
        if c == b'\'' {
            in_quote = true;
            i += 1;
            continue;
        }
        if i + nb.len() <= sb.len() && sb[i..i + nb.len()].eq_ignore_ascii_case(nb) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn has_from_trans(s: &str) -> bool {
    match find_top_level_ci(s, " FROM TRANS") {
        Some(idx) => {
            let after = idx + " FROM TRANS".len();
            s.as_bytes()
                .get(after)
                .map(|b| *b == b' ')
                .unwrap_or(true)
        }
        None => false,
    }
}

/// Splits on `delim` outside string literals and parentheses.
fn split_top_level(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    for c in s.chars() {
        if in_quote {
            cur.push(c);
            if c == '\'' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                cur.push(c);
            }
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            c if c == delim && depth == 0 => {
                parts.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur.trim().to_string());
    }
    parts
}

/// Extracts the contents of the parenthesized group starting at `open`,
/// returning the inner text and the byte offset just past the close paren.
fn paren_group(s: &str, open: usize) -> Option<(String, usize)> {
    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, c) in s[open..].char_indices() {
        if in_quote {
            if c == '\'' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let inner = s[open + 1..open + i].to_string();
                    return Some((inner, open + i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_literal(tok: &str) -> Option<Value> {
    let t = tok.trim();
    if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') {
        let inner = &t[1..t.len() - 1];
        return Some(Value::Text(inner.replace("''", "'")));
    }
    if t.eq_ignore_ascii_case("NULL") {
        return Some(Value::Null);
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(Value::Int(n));
    }
    if let Ok(x) = t.parse::<f64>() {
        return Some(Value::Float(x));
    }
    None
}

/// Parses the sole supported predicate, `trans_id = N`.
fn parse_trans_id_predicate(clause: &str) -> Option<i64> {
    let mut parts = clause.splitn(2, '=');
    let col = parts.next()?.trim();
    let rhs = parts.next()?.trim();
    if !col.eq_ignore_ascii_case("trans_id") {
        return None;
    }
    rhs.parse::<i64>().ok()
}

fn parse_insert(s: &str) -> Option<TransStatement> {
    let cols_open = s.find('(')?;
    let (cols_inner, after_cols) = paren_group(s, cols_open)?;
    let rest = s[after_cols..].trim_start();
    if rest.len() < 6 || !rest[..6].eq_ignore_ascii_case("VALUES") {
        return None;
    }
    let vals_rel = rest.find('(')?;
    let (vals_inner, _) = paren_group(rest, vals_rel)?;

    let columns: Vec<String> = split_top_level(&cols_inner, ',')
        .into_iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let values: Vec<Value> = split_top_level(&vals_inner, ',')
        .iter()
        .map(|v| parse_literal(v))
        .collect::<Option<Vec<_>>>()?;
    if columns.is_empty() || columns.len() != values.len() {
        return None;
    }
    Some(TransStatement::Insert { columns, values })
}

fn parse_update(s: &str) -> Option<TransStatement> {
    let set_start = "UPDATE trans SET ".len();
    let where_idx = find_top_level_ci(s, " WHERE ")?;
    if where_idx <= set_start {
        return None;
    }
    let sets_str = &s[set_start..where_idx];
    let clause = &s[where_idx + " WHERE ".len()..];
    let trans_id = parse_trans_id_predicate(clause)?;

    let mut sets = Vec::new();
    for assignment in split_top_level(sets_str, ',') {
        let mut parts = assignment.splitn(2, '=');
        let col = parts.next()?.trim().to_ascii_lowercase();
        let value = parse_literal(parts.next()?)?;
        sets.push((col, value));
    }
    if sets.is_empty() {
        return None;
    }
    Some(TransStatement::Update { sets, trans_id })
}

fn parse_delete(s: &str) -> Option<TransStatement> {
    let clause = &s["DELETE FROM trans WHERE ".len()..];
    let trans_id = parse_trans_id_predicate(clause)?;
    Some(TransStatement::Delete { trans_id })
}

fn parse_select(s: &str, u: &str) -> Option<TransStatement> {
    if u.contains("MAX(TRANS_ID)") {
        return Some(TransStatement::Select(SelectSpec {
            max_id: true,
            ..SelectSpec::default()
        }));
    }

    let mut spec = SelectSpec::default();
    let mut tail_end = s.len();

    if let Some(limit_idx) = find_top_level_ci(s, " LIMIT ") {
        let n = s[limit_idx + " LIMIT ".len()..].trim();
        spec.limit = Some(n.parse::<usize>().ok()?);
        tail_end = limit_idx;
    }
    let mut clause_end = tail_end;
    if let Some(order_idx) = find_top_level_ci(&s[..tail_end], " ORDER BY ") {
        // Ordering is by trans_id in every produced statement; rows come back
        // sorted regardless.
        clause_end = order_idx;
    }
    if let Some(where_idx) = find_top_level_ci(&s[..clause_end], " WHERE ") {
        let clause = &s[where_idx + " WHERE ".len()..clause_end];
        spec.trans_id = Some(parse_trans_id_predicate(clause)?);
    }
    Some(TransStatement::Select(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_insert() {
        let stmt = parse(
            "INSERT INTO trans (trans_id, account_id, trans_type, amount) \
             VALUES (1001, 4, 'Credit', 1000.0)",
        )
        .unwrap();
        match stmt {
            TransStatement::Insert { columns, values } => {
                assert_eq!(columns, vec!["trans_id", "account_id", "trans_type", "amount"]);
                assert_eq!(values[0], Value::Int(1001));
                assert_eq!(values[2], Value::Text("Credit".to_string()));
                assert_eq!(values[3], Value::Float(1000.0));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_insert_quoted_comma_and_escape() {
        let stmt =
            parse("INSERT INTO trans (trans_id, k_symbol) VALUES (5, 'a, ''quoted'' b')").unwrap();
        match stmt {
            TransStatement::Insert { values, .. } => {
                assert_eq!(values[1], Value::Text("a, 'quoted' b".to_string()));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_update() {
        let stmt = parse("UPDATE trans SET amount = 5000.0, k_symbol = 'X' WHERE trans_id = 7")
            .unwrap();
        assert_eq!(
            stmt,
            TransStatement::Update {
                sets: vec![
                    ("amount".to_string(), Value::Float(5000.0)),
                    ("k_symbol".to_string(), Value::Text("X".to_string())),
                ],
                trans_id: 7,
            }
        );
    }

    #[test]
    fn test_parse_delete() {
        assert_eq!(
            parse("DELETE FROM trans WHERE trans_id = 42"),
            Some(TransStatement::Delete { trans_id: 42 })
        );
    }

    #[test]
    fn test_parse_select_variants() {
        assert_eq!(
            parse("SELECT * FROM trans LIMIT 50"),
            Some(TransStatement::Select(SelectSpec {
                limit: Some(50),
                ..SelectSpec::default()
            }))
        );
        assert_eq!(
            parse("SELECT * FROM trans WHERE trans_id = 9"),
            Some(TransStatement::Select(SelectSpec {
                trans_id: Some(9),
                ..SelectSpec::default()
            }))
        );
        assert_eq!(
            parse("SELECT * FROM trans ORDER BY trans_id LIMIT 10"),
            Some(TransStatement::Select(SelectSpec {
                limit: Some(10),
                ..SelectSpec::default()
            }))
        );
        match parse("SELECT MAX(trans_id) AS max_id FROM trans").unwrap() {
            TransStatement::Select(spec) => assert!(spec.max_id),
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_other_tables() {
        assert_eq!(parse("SELECT * FROM transfers"), None);
        assert_eq!(parse("DROP TABLE trans"), None);
        assert_eq!(parse("INSERT INTO accounts (id) VALUES (1)"), None);
    }

    #[test]
    fn test_whitespace_normalization() {
        let stmt = parse("  UPDATE   trans\n SET amount =  1 WHERE trans_id = 2 ;").unwrap();
        assert_eq!(
            stmt,
            TransStatement::Update {
                sets: vec![("amount".to_string(), Value::Int(1))],
                trans_id: 2,
            }
        );
    }
}
