//! Join-column lookup derived from foreign keys.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::schema::TableDescriptor;

/// One foreign key seen as a join: `child.child_column → parent.parent_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinEdge {
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// Bidirectional `(table_a, table_b) → (column_a, column_b)` map.
///
/// Both directions of one foreign key are registered together, so
/// `get(a, b)` and `get(b, a)` always return mutually inverse pairs. When
/// several foreign keys link the same two tables the first one wins.
#[derive(Debug, Clone, Default)]
pub struct JoinMapper {
    pairs: HashMap<(String, String), (String, String)>,
    edges: Vec<JoinEdge>,
}

impl JoinMapper {
    /// Register every single-column foreign key of `tables`.
    pub fn build<'a>(tables: impl IntoIterator<Item = &'a TableDescriptor>) -> Self {
        let mut mapper = Self::default();
        for table in tables {
            for fk in &table.foreign_keys {
                if fk.columns.len() != 1 || fk.ref_columns.len() != 1 {
                    continue;
                }
                mapper.register(JoinEdge {
                    child_table: table.name.clone(),
                    child_column: fk.columns[0].clone(),
                    parent_table: fk.ref_table.clone(),
                    parent_column: fk.ref_columns[0].clone(),
                });
            }
        }
        mapper
    }

    fn register(&mut self, edge: JoinEdge) {
        let forward = (edge.child_table.clone(), edge.parent_table.clone());
        let backward = (edge.parent_table.clone(), edge.child_table.clone());
        if self.pairs.contains_key(&forward) || self.pairs.contains_key(&backward) {
            return;
        }
        // A self-reference has one key for both directions; keep child → parent.
        if forward != backward {
            self.pairs.insert(
                backward,
                (edge.parent_column.clone(), edge.child_column.clone()),
            );
        }
        self.pairs.insert(
            forward,
            (edge.child_column.clone(), edge.parent_column.clone()),
        );
        self.edges.push(edge);
    }

    /// Join columns `(column of a, column of b)`, if a foreign key links them.
    pub fn get(&self, a: &str, b: &str) -> Option<(&str, &str)> {
        self.pairs
            .get(&(a.to_string(), b.to_string()))
            .map(|(x, y)| (x.as_str(), y.as_str()))
    }

    /// Every registered edge, in registration order.
    pub fn edges(&self) -> &[JoinEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ForeignKey;

    fn fk(name: &str, column: &str, ref_table: &str, ref_column: &str) -> ForeignKey {
        ForeignKey {
            name: name.to_string(),
            columns: vec![column.to_string()],
            ref_table: ref_table.to_string(),
            ref_schema: "public".to_string(),
            ref_columns: vec![ref_column.to_string()],
            on_delete: "NO_ACTION".to_string(),
            on_update: "NO_ACTION".to_string(),
        }
    }

    fn library() -> Vec<TableDescriptor> {
        let books = TableDescriptor::new("public", "books");
        let readers = TableDescriptor::new("public", "readers");
        let mut loans = TableDescriptor::new("public", "loan_records");
        loans
            .foreign_keys
            .push(fk("loan_records_book_id_fkey", "book_id", "books", "book_id"));
        loans.foreign_keys.push(fk(
            "loan_records_reader_id_fkey",
            "reader_id",
            "readers",
            "reader_id",
        ));
        vec![books, readers, loans]
    }

    #[test]
    fn test_both_directions_are_inverse() {
        let tables = library();
        let mapper = JoinMapper::build(&tables);
        assert_eq!(mapper.len(), 2);

        for edge in mapper.edges() {
            let (c, p) = mapper.get(&edge.child_table, &edge.parent_table).unwrap();
            let (p2, c2) = mapper.get(&edge.parent_table, &edge.child_table).unwrap();
            assert_eq!((c, p), (c2, p2));
        }
        assert_eq!(
            mapper.get("loan_records", "books"),
            Some(("book_id", "book_id"))
        );
    }

    #[test]
    fn test_unlinked_tables_not_found() {
        let tables = library();
        let mapper = JoinMapper::build(&tables);
        assert!(mapper.get("books", "readers").is_none());
    }

    #[test]
    fn test_first_fk_wins_and_composite_skipped() {
        let mut loans = TableDescriptor::new("public", "loan_records");
        loans
            .foreign_keys
            .push(fk("first", "book_id", "books", "book_id"));
        loans
            .foreign_keys
            .push(fk("second", "replacement_book_id", "books", "book_id"));
        let mut composite = fk("composite", "a", "books", "x");
        composite.columns.push("b".into());
        composite.ref_columns.push("y".into());
        loans.foreign_keys.push(composite);

        let mapper = JoinMapper::build([&loans]);
        assert_eq!(mapper.len(), 1);
        assert_eq!(
            mapper.get("books", "loan_records"),
            Some(("book_id", "book_id"))
        );
    }
}
