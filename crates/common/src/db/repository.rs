//! Repository for the legal reference store
//!
//! Read-only access to:
//! - Pages looked up by natural id and language
//! - Legislation sections referenced by pages
//! - Legislation sections referenced by other sections

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::Result;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbBackend, EntityTrait, FromQueryResult, QueryFilter,
    QueryOrder, Statement,
};
use serde::{Deserialize, Serialize};

/// A legislation section reached through a reference edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromQueryResult)]
pub struct SectionRow {
    /// Page nid or source section id the edge starts from
    pub origin_id: i64,
    pub id: i64,
    pub cap_number: String,
    pub section_number: String,
    pub subsection_number: Option<String>,
    pub cap_title: String,
    pub section_heading: Option<String>,
    pub content: String,
    pub url: String,
}

const SECTION_COLUMNS: &str = r#"
    s.id,
    s.cap_number,
    s.section_number,
    s.subsection_number,
    c.title AS cap_title,
    s.section_heading,
    s.content,
    s.url
"#;

/// `$start, $start+1, ...` for an IN list of `count` values
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Pages with the given natural ids in one language, ordered by nid
    pub async fn find_pages_by_nids(&self, nids: &[i64], language: &str) -> Result<Vec<ClicPage>> {
        if nids.is_empty() {
            return Ok(Vec::new());
        }

        ClicPageEntity::find()
            .filter(ClicPageColumn::Nid.is_in(nids.iter().copied()))
            .filter(ClicPageColumn::LanguageCode.eq(language))
            .order_by_asc(ClicPageColumn::Nid)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Reference graph
    // ========================================================================

    /// Sections directly referenced by the pages with these nids.
    /// `origin_id` carries the page nid.
    pub async fn referenced_sections_for_pages(
        &self,
        nids: &[i64],
        language: &str,
    ) -> Result<Vec<SectionRow>> {
        if nids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT p.nid AS origin_id, {}
            FROM page_section_references r
            JOIN clic_pages p ON p.id = r.page_id
            JOIN legislation_sections s ON s.id = r.section_id
            JOIN legislation_caps c ON c.id = s.cap_id
            WHERE p.language_code = $1
              AND p.nid IN ({})
            ORDER BY p.nid, s.id
            "#,
            SECTION_COLUMNS,
            placeholders(2, nids.len())
        );

        let mut values: Vec<sea_orm::Value> = vec![language.into()];
        values.extend(nids.iter().map(|nid| sea_orm::Value::from(*nid)));

        self.query_sections(&sql, values).await
    }

    /// Sections directly referenced by the sections with these ids.
    /// `origin_id` carries the source section id.
    pub async fn referenced_sections_for_sections(&self, ids: &[i64]) -> Result<Vec<SectionRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT r.source_section_id AS origin_id, {}
            FROM section_references r
            JOIN legislation_sections s ON s.id = r.target_section_id
            JOIN legislation_caps c ON c.id = s.cap_id
            WHERE r.source_section_id IN ({})
            ORDER BY r.source_section_id, s.id
            "#,
            SECTION_COLUMNS,
            placeholders(1, ids.len())
        );

        let values = ids.iter().map(|id| sea_orm::Value::from(*id)).collect();

        self.query_sections(&sql, values).await
    }

    async fn query_sections(&self, sql: &str, values: Vec<sea_orm::Value>) -> Result<Vec<SectionRow>> {
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);

        let rows = SectionRow::find_by_statement(stmt)
            .all(self.read_conn())
            .await?;

        tracing::debug!(rows = rows.len(), "Reference query completed");
        Ok(rows)
    }
}
