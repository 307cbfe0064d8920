#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use inference_ledger_core::{
    curate, finish_page, format_rfc3339, from_unix_ms, from_unix_ns, now_utc, unix_ns,
    CurationRequest, Episode, FeedbackInput, FeedbackRecord, FeedbackValue, FunctionType,
    Inference, InferenceInput, InferenceKey, LedgerError, LedgerId, LedgerQueries, MetricConfig,
    MetricKind, MetricLevel, PageCursor, PageRequest, TableBounds, VariantCount, VariantShape,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::{debug, instrument, warn};

const LEDGER_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS inferences (
  id TEXT PRIMARY KEY,
  function_name TEXT NOT NULL,
  variant_name TEXT NOT NULL,
  function_type TEXT NOT NULL CHECK (function_type IN ('chat', 'json')),
  episode_id TEXT NOT NULL,
  shape_json TEXT NOT NULL,
  input_json TEXT NOT NULL DEFAULT '{}',
  output_json TEXT NOT NULL DEFAULT '{}',
  created_at_ms INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_inferences_no_update
BEFORE UPDATE ON inferences
BEGIN
  SELECT RAISE(FAIL, 'inferences is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_inferences_no_delete
BEFORE DELETE ON inferences
BEGIN
  SELECT RAISE(FAIL, 'inferences is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_inferences_function_id
  ON inferences(function_name, function_type, id);
CREATE INDEX IF NOT EXISTS idx_inferences_episode_id
  ON inferences(episode_id, id);

CREATE TABLE IF NOT EXISTS feedback (
  feedback_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  feedback_id TEXT NOT NULL UNIQUE,
  metric_name TEXT NOT NULL,
  metric_kind TEXT NOT NULL CHECK (metric_kind IN ('boolean', 'float', 'demonstration')),
  target_id TEXT NOT NULL,
  value_bool INTEGER CHECK (value_bool IN (0, 1) OR value_bool IS NULL),
  value_float REAL,
  demonstration_json TEXT,
  occurred_at_ns INTEGER NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_feedback_no_update
BEFORE UPDATE ON feedback
BEGIN
  SELECT RAISE(FAIL, 'feedback is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_feedback_no_delete
BEFORE DELETE ON feedback
BEGIN
  SELECT RAISE(FAIL, 'feedback is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_feedback_metric_target
  ON feedback(metric_name, metric_kind, target_id, occurred_at_ns, feedback_seq);
";

const INFERENCE_COLUMNS: &str = "id, function_name, variant_name, episode_id, shape_json, \
     input_json, output_json, created_at_ms";

const FEEDBACK_COLUMNS: &str = "feedback_seq, feedback_id, metric_name, metric_kind, target_id, \
     value_bool, value_float, demonstration_json, occurred_at_ns";

const EPISODE_AGGREGATE: &str = "SELECT episode_id, count, start_ms, end_ms, last_inference_id
     FROM (
        SELECT
          episode_id,
          COUNT(*) AS count,
          MIN(created_at_ms) AS start_ms,
          MAX(created_at_ms) AS end_ms,
          MAX(id) AS last_inference_id
        FROM inferences
        GROUP BY episode_id
     )";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u32,
    pub read_only: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            read_only: false,
        }
    }
}

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Opens an existing, migrated ledger without write access.
    ///
    /// A missing file or a database without the ledger schema is reported as
    /// [`LedgerError::Connectivity`], never as an empty ledger.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_with(
            path,
            StoreOptions {
                read_only: true,
                ..StoreOptions::default()
            },
        )
    }

    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn open_with(path: &Path, options: StoreOptions) -> Result<Self> {
        let flags = if options.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::default()
        };

        let conn = Connection::open_with_flags(path, flags).map_err(|err| {
            warn!(error = %err, "ledger store unavailable");
            LedgerError::Connectivity(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        if options.read_only {
            conn.execute_batch(&format!(
                "PRAGMA query_only = ON;
                 PRAGMA busy_timeout = {};",
                options.busy_timeout_ms
            ))
            .context("failed to configure sqlite pragmas")?;
            ensure_ledger_schema(&conn)?;
        } else {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                options.busy_timeout_ms
            ))
            .context("failed to configure sqlite pragmas")?;
        }

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        debug!(version = LEDGER_MIGRATION_VERSION, "ledger schema migrated");
        Ok(())
    }

    #[instrument(skip(self, input), fields(function_name = %input.function_name))]
    pub fn append_inference(&self, input: &InferenceInput) -> Result<Inference> {
        input
            .validate()
            .map_err(|err| anyhow::Error::new(err).context("inference validation failed"))?;

        let id = input.id.unwrap_or_else(LedgerId::new);
        let created_at_ms = i64::try_from(id.timestamp_ms())
            .with_context(|| format!("identifier timestamp out of range: {id}"))?;
        let shape_json = serde_json::to_string(&input.shape).context("failed to serialize shape")?;
        let input_json = serde_json::to_string(&input.input).context("failed to serialize input")?;
        let output_json =
            serde_json::to_string(&input.output).context("failed to serialize output")?;

        self.conn
            .execute(
                "INSERT INTO inferences(
                    id, function_name, variant_name, function_type, episode_id,
                    shape_json, input_json, output_json, created_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    input.function_name,
                    input.variant_name,
                    input.shape.function_type().as_str(),
                    input.episode_id.to_string(),
                    shape_json,
                    input_json,
                    output_json,
                    created_at_ms,
                ],
            )
            .with_context(|| format!("failed to append inference {id}"))?;

        Ok(Inference {
            id,
            function_name: input.function_name.clone(),
            variant_name: input.variant_name.clone(),
            episode_id: input.episode_id,
            shape: input.shape.clone(),
            input: input.input.clone(),
            output: input.output.clone(),
            timestamp: from_unix_ms(created_at_ms)?,
        })
    }

    #[instrument(skip(self, input), fields(metric_name = %input.metric_name, target_id = %input.target_id))]
    pub fn append_feedback(&self, input: &FeedbackInput) -> Result<FeedbackRecord> {
        input
            .validate()
            .map_err(|err| anyhow::Error::new(err).context("feedback validation failed"))?;

        let feedback_id = input.feedback_id.unwrap_or_else(LedgerId::new);
        let (value_bool, value_float, demonstration_json) = match &input.value {
            FeedbackValue::Boolean(flag) => (Some(bool_to_sql(*flag)), None, None),
            FeedbackValue::Float(score) => (None, Some(*score), None),
            FeedbackValue::Demonstration(payload) => (
                None,
                None,
                Some(
                    serde_json::to_string(payload)
                        .context("failed to serialize demonstration")?,
                ),
            ),
        };

        self.conn
            .execute(
                "INSERT INTO feedback(
                    feedback_id, metric_name, metric_kind, target_id,
                    value_bool, value_float, demonstration_json,
                    occurred_at_ns, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    feedback_id.to_string(),
                    input.metric_name,
                    input.value.kind().as_str(),
                    input.target_id.to_string(),
                    value_bool,
                    value_float,
                    demonstration_json,
                    unix_ns(input.occurred_at)?,
                    format_rfc3339(now_utc())?,
                ],
            )
            .with_context(|| format!("failed to append feedback {feedback_id}"))?;

        Ok(FeedbackRecord {
            feedback_seq: self.conn.last_insert_rowid(),
            feedback_id,
            metric_name: input.metric_name.clone(),
            target_id: input.target_id,
            value: input.value.clone(),
            occurred_at: input.occurred_at,
        })
    }

    /// Inference counts per variant of a function, most recently used first.
    #[instrument(skip(self, shape))]
    pub fn count_inferences_by_variant(
        &self,
        function_name: &str,
        shape: &VariantShape,
    ) -> Result<Vec<VariantCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT variant_name, COUNT(*) AS inference_count, MAX(id) AS last_inference_id
             FROM inferences
             WHERE function_name = ?1 AND function_type = ?2
             GROUP BY variant_name
             ORDER BY last_inference_id DESC",
        )?;

        let rows = stmt.query_map(
            params![function_name, shape.function_type().as_str()],
            |row| {
                Ok(VariantCount {
                    variant_name: row.get(0)?,
                    inference_count: parse_count(row.get(1)?, 1)?,
                    last_inference_id: parse_ledger_id(&row.get::<_, String>(2)?, 2)?,
                })
            },
        )?;

        collect_rows(rows)
    }

    pub fn count_inferences_for_episode(&self, episode_id: LedgerId) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM inferences WHERE episode_id = ?1",
            params![episode_id.to_string()],
            |row| row.get(0),
        )?;
        u64::try_from(count).with_context(|| format!("invalid inference count: {count}"))
    }

    /// Member inferences of an episode in creation order.
    pub fn list_inferences_for_episode(&self, episode_id: LedgerId) -> Result<Vec<Inference>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INFERENCE_COLUMNS}
             FROM inferences
             WHERE episode_id = ?1
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![episode_id.to_string()], parse_inference_row)?;
        collect_rows(rows)
    }

    fn function_inferences(
        &self,
        function_name: &str,
        function_type: FunctionType,
    ) -> Result<Vec<Inference>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INFERENCE_COLUMNS}
             FROM inferences
             WHERE function_name = ?1 AND function_type = ?2
             ORDER BY id DESC"
        ))?;

        let rows = stmt.query_map(
            params![function_name, function_type.as_str()],
            parse_inference_row,
        )?;
        collect_rows(rows)
    }

    fn function_inference_keys(
        &self,
        function_name: &str,
        function_type: FunctionType,
    ) -> Result<Vec<InferenceKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, episode_id
             FROM inferences
             WHERE function_name = ?1 AND function_type = ?2
             ORDER BY id DESC",
        )?;

        let rows = stmt.query_map(params![function_name, function_type.as_str()], |row| {
            Ok(InferenceKey {
                id: parse_ledger_id(&row.get::<_, String>(0)?, 0)?,
                episode_id: parse_ledger_id(&row.get::<_, String>(1)?, 1)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Feedback rows for `metric_name` whose target belongs to the function.
    fn function_feedback(
        &self,
        function_name: &str,
        function_type: FunctionType,
        metric_name: &str,
        config: MetricConfig,
    ) -> Result<Vec<FeedbackRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS}
             FROM feedback
             WHERE metric_name = ?1
               AND metric_kind = ?2
               AND target_id IN (
                 SELECT {target}
                 FROM inferences
                 WHERE function_name = ?3 AND function_type = ?4
               )
             ORDER BY feedback_seq ASC",
            target = target_column(config.level())
        ))?;

        let rows = stmt.query_map(
            params![
                metric_name,
                config.kind().as_str(),
                function_name,
                function_type.as_str()
            ],
            parse_feedback_row,
        )?;
        collect_rows(rows)
    }

    fn request_feedback(&self, request: &CurationRequest) -> Result<Vec<FeedbackRecord>> {
        match &request.metric {
            Some(metric) => self.function_feedback(
                &request.function_name,
                request.shape.function_type(),
                &metric.name,
                metric.config,
            ),
            None => Ok(Vec::new()),
        }
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LedgerQueries for SqliteLedgerStore {
    #[instrument(skip(self))]
    fn query_inference_table(&self, page: &PageRequest) -> Result<Vec<Inference>> {
        let cursor = page.cursor()?;
        let (clause, values) = keyset_clause(cursor, "id", page.page_size);

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {INFERENCE_COLUMNS} FROM inferences {clause}"))?;
        let rows = stmt.query_map(params_from_iter(values), parse_inference_row)?;
        let page_rows = finish_page(collect_rows(rows)?, cursor);

        debug!(rows = page_rows.len(), "queried inference page");
        Ok(page_rows)
    }

    #[instrument(skip(self))]
    fn query_episode_table(&self, page: &PageRequest) -> Result<Vec<Episode>> {
        let cursor = page.cursor()?;
        let (clause, values) = keyset_clause(cursor, "last_inference_id", page.page_size);

        let mut stmt = self
            .conn
            .prepare(&format!("{EPISODE_AGGREGATE} {clause}"))?;
        let rows = stmt.query_map(params_from_iter(values), parse_episode_row)?;
        let page_rows = finish_page(collect_rows(rows)?, cursor);

        debug!(rows = page_rows.len(), "queried episode page");
        Ok(page_rows)
    }

    #[instrument(skip(self))]
    fn query_inference_table_bounds(&self) -> Result<TableBounds> {
        self.bounds_query("SELECT MIN(id), MAX(id) FROM inferences")
    }

    #[instrument(skip(self))]
    fn query_episode_table_bounds(&self) -> Result<TableBounds> {
        self.bounds_query(
            "SELECT MIN(last_inference_id), MAX(last_inference_id)
             FROM (
                SELECT MAX(id) AS last_inference_id
                FROM inferences
                GROUP BY episode_id
             )",
        )
    }

    #[instrument(skip(self, shape), fields(function_type = shape.function_type().as_str()))]
    fn count_inferences_for_function(
        &self,
        function_name: &str,
        shape: &VariantShape,
    ) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM inferences WHERE function_name = ?1 AND function_type = ?2",
            params![function_name, shape.function_type().as_str()],
            |row| row.get(0),
        )?;

        debug!(count, "counted function inferences");
        u64::try_from(count).with_context(|| format!("invalid inference count: {count}"))
    }

    #[instrument(skip(self, shape, config), fields(level = config.level().as_str()))]
    fn count_feedbacks_for_metric(
        &self,
        function_name: &str,
        shape: &VariantShape,
        metric_name: &str,
        config: &MetricConfig,
    ) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*)
                 FROM feedback
                 WHERE metric_name = ?1
                   AND metric_kind = ?2
                   AND target_id IN (
                     SELECT {target}
                     FROM inferences
                     WHERE function_name = ?3 AND function_type = ?4
                   )",
                target = target_column(config.level())
            ),
            params![
                metric_name,
                config.kind().as_str(),
                function_name,
                shape.function_type().as_str()
            ],
            |row| row.get(0),
        )?;

        debug!(count, "counted metric feedback rows");
        u64::try_from(count).with_context(|| format!("invalid feedback count: {count}"))
    }

    /// Size of the full qualifying set; `request.limit` is not applied.
    #[instrument(skip(self, request), fields(function_name = %request.function_name))]
    fn count_curated_inferences(&self, request: &CurationRequest) -> Result<u64> {
        let request = validated_request(request)?;
        let candidates =
            self.function_inference_keys(&request.function_name, request.shape.function_type())?;
        let feedback = self.request_feedback(request)?;

        let selected = curate(
            &candidates,
            request.metric.as_ref(),
            &feedback,
            request.threshold,
            None,
        );

        debug!(
            candidates = candidates.len(),
            feedback_rows = feedback.len(),
            selected = selected.len(),
            "counted curated inferences"
        );
        u64::try_from(selected.len()).context("curated count overflow")
    }

    #[instrument(skip(self, request), fields(function_name = %request.function_name, limit = ?request.limit))]
    fn get_curated_inferences(&self, request: &CurationRequest) -> Result<Vec<Inference>> {
        let request = validated_request(request)?;
        let candidates =
            self.function_inferences(&request.function_name, request.shape.function_type())?;
        let feedback = self.request_feedback(request)?;

        let selected = curate(
            &candidates,
            request.metric.as_ref(),
            &feedback,
            request.threshold,
            request.limit,
        )
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();

        debug!(
            candidates = candidates.len(),
            selected = selected.len(),
            "selected curated inferences"
        );
        Ok(selected)
    }

    fn check_connection(&self) -> bool {
        let ping = self
            .conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0));
        match ping {
            Ok(value) => value == 1,
            Err(err) => {
                warn!(error = %err, "ledger connection check failed");
                false
            }
        }
    }
}

impl SqliteLedgerStore {
    fn bounds_query(&self, sql: &str) -> Result<TableBounds> {
        let (first_raw, last_raw): (Option<String>, Option<String>) = self
            .conn
            .query_row(sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let first_id = first_raw
            .as_deref()
            .map(|raw| parse_ledger_id(raw, 0))
            .transpose()?;
        let last_id = last_raw
            .as_deref()
            .map(|raw| parse_ledger_id(raw, 1))
            .transpose()?;

        Ok(TableBounds { first_id, last_id })
    }
}

/// Builds the `WHERE ... ORDER BY ... LIMIT` tail for a keyset page.
///
/// `?1` is always the page size; `?2` is the cursor when one is set.
fn keyset_clause(cursor: PageCursor, key_column: &str, page_size: u32) -> (String, Vec<SqlValue>) {
    let mut values = vec![SqlValue::Integer(i64::from(page_size))];
    let clause = match cursor {
        PageCursor::Latest => format!("ORDER BY {key_column} DESC LIMIT ?1"),
        PageCursor::Before(id) => {
            values.push(SqlValue::Text(id.to_string()));
            format!("WHERE {key_column} < ?2 ORDER BY {key_column} DESC LIMIT ?1")
        }
        PageCursor::After(id) => {
            values.push(SqlValue::Text(id.to_string()));
            format!("WHERE {key_column} > ?2 ORDER BY {key_column} ASC LIMIT ?1")
        }
    };
    (clause, values)
}

fn validated_request(request: &CurationRequest) -> Result<&CurationRequest> {
    request
        .validate()
        .map_err(|err| anyhow::Error::new(err).context("invalid curation request"))?;
    Ok(request)
}

fn target_column(level: MetricLevel) -> &'static str {
    match level {
        MetricLevel::Inference => "id",
        MetricLevel::Episode => "episode_id",
    }
}

fn parse_inference_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Inference> {
    let shape_raw: String = row.get(4)?;
    let input_raw: String = row.get(5)?;
    let output_raw: String = row.get(6)?;
    let created_at_ms: i64 = row.get(7)?;

    let shape: VariantShape = serde_json::from_str(&shape_raw)
        .map_err(|err| conversion_error(4, format!("invalid shape_json: {err}")))?;
    let input: Value = serde_json::from_str(&input_raw)
        .map_err(|err| conversion_error(5, format!("invalid input_json: {err}")))?;
    let output: Value = serde_json::from_str(&output_raw)
        .map_err(|err| conversion_error(6, format!("invalid output_json: {err}")))?;

    Ok(Inference {
        id: parse_ledger_id(&row.get::<_, String>(0)?, 0)?,
        function_name: row.get(1)?,
        variant_name: row.get(2)?,
        episode_id: parse_ledger_id(&row.get::<_, String>(3)?, 3)?,
        shape,
        input,
        output,
        timestamp: from_unix_ms(created_at_ms).map_err(|err| conversion_error(7, err.to_string()))?,
    })
}

fn parse_episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let start_ms: i64 = row.get(2)?;
    let end_ms: i64 = row.get(3)?;

    Ok(Episode {
        episode_id: parse_ledger_id(&row.get::<_, String>(0)?, 0)?,
        count: parse_count(row.get(1)?, 1)?,
        start_time: from_unix_ms(start_ms).map_err(|err| conversion_error(2, err.to_string()))?,
        end_time: from_unix_ms(end_ms).map_err(|err| conversion_error(3, err.to_string()))?,
        last_inference_id: parse_ledger_id(&row.get::<_, String>(4)?, 4)?,
    })
}

fn parse_feedback_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackRecord> {
    let kind_raw: String = row.get(3)?;
    let value_bool: Option<i64> = row.get(5)?;
    let value_float: Option<f64> = row.get(6)?;
    let demonstration_raw: Option<String> = row.get(7)?;
    let occurred_at_ns: i64 = row.get(8)?;

    let kind = MetricKind::parse(&kind_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid metric_kind: {kind_raw}")))?;

    let value = match kind {
        MetricKind::Boolean => FeedbackValue::Boolean(
            value_bool.ok_or_else(|| conversion_error(5, "boolean feedback missing value"))? == 1,
        ),
        MetricKind::Float => FeedbackValue::Float(
            value_float.ok_or_else(|| conversion_error(6, "float feedback missing value"))?,
        ),
        MetricKind::Demonstration => {
            let raw = demonstration_raw
                .ok_or_else(|| conversion_error(7, "demonstration feedback missing payload"))?;
            FeedbackValue::Demonstration(
                serde_json::from_str(&raw)
                    .map_err(|err| conversion_error(7, format!("invalid demonstration: {err}")))?,
            )
        }
    };

    Ok(FeedbackRecord {
        feedback_seq: row.get(0)?,
        feedback_id: parse_ledger_id(&row.get::<_, String>(1)?, 1)?,
        metric_name: row.get(2)?,
        target_id: parse_ledger_id(&row.get::<_, String>(4)?, 4)?,
        value,
        occurred_at: from_unix_ns(occurred_at_ns)
            .map_err(|err| conversion_error(8, err.to_string()))?,
    })
}

fn parse_ledger_id(raw: &str, column: usize) -> rusqlite::Result<LedgerId> {
    LedgerId::parse(raw).map_err(|_| conversion_error(column, format!("invalid ULID: {raw}")))
}

fn parse_count(value: i64, column: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| conversion_error(column, format!("invalid count: {value}")))
}

fn conversion_error(column: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.into(),
        )),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn ensure_ledger_schema(conn: &Connection) -> Result<()> {
    for (table, columns) in [
        (
            "inferences",
            &[
                "id",
                "function_name",
                "function_type",
                "episode_id",
                "created_at_ms",
            ][..],
        ),
        (
            "feedback",
            &[
                "feedback_seq",
                "metric_name",
                "metric_kind",
                "target_id",
                "occurred_at_ns",
            ][..],
        ),
    ] {
        if !table_exists(conn, table)? {
            return Err(LedgerError::Connectivity(format!(
                "ledger schema check failed: expected table {table}; run `ledger migrate` first"
            ))
            .into());
        }
        ensure_table_has_columns(conn, table, columns)?;
    }

    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(LedgerError::Connectivity(format!(
                "ledger schema check failed: missing column {table_name}.{required}"
            ))
            .into());
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
