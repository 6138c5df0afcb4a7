//! Validation Stage
//!
//! Static checks of a candidate query against a metadata snapshot. Forbidden
//! operations are rejected first and never repaired. The query is then
//! walked block by block: tables must exist, columns must resolve against
//! the FROM relations of their own block (or an enclosing one), aliases are
//! normalized and aggregated blocks must group every plain select item.
//! Each check passes, repairs the AST (recording the fix), or rejects.

use crate::fuzzy_matcher::NameMatcher;
use crate::generation::CandidateQuery;
use crate::metadata::MetadataSnapshot;
use crate::sql::{check_read_only, parse_query, GuardViolation, Resolver, Unresolved, WRITE_OPERATION_FORBIDDEN};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Forbidden,
    Malformed,
    UnknownTable,
    UnknownColumn,
    AmbiguousColumn,
    AmbiguousAggregation,
}

impl RejectionKind {
    /// Whether a fresh generation could plausibly fix the query.
    pub fn is_regenerable(&self) -> bool {
        !matches!(self, RejectionKind::Forbidden)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
    /// Closest known names, for regeneration feedback.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl Rejection {
    fn new(kind: RejectionKind, reason: String) -> Self {
        Self {
            kind,
            reason,
            suggestions: Vec::new(),
        }
    }

    fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

impl From<Unresolved> for Rejection {
    fn from(unresolved: Unresolved) -> Self {
        match unresolved {
            Unresolved::Table { name, suggestions } => {
                Rejection::new(RejectionKind::UnknownTable, format!("unknown table '{}'", name))
                    .with_suggestions(suggestions)
            }
            Unresolved::Qualifier { qualifier, column } => Rejection::new(
                RejectionKind::UnknownTable,
                format!("unknown table or alias '{}' in '{}.{}'", qualifier, qualifier, column),
            ),
            Unresolved::Column {
                column,
                relation: Some(relation),
                suggestions,
            } => Rejection::new(
                RejectionKind::UnknownColumn,
                format!("unknown column '{}' in table '{}'", column, relation),
            )
            .with_suggestions(suggestions),
            Unresolved::Column {
                column,
                relation: None,
                suggestions,
            } => Rejection::new(RejectionKind::UnknownColumn, format!("unknown column '{}'", column))
                .with_suggestions(suggestions),
            Unresolved::Ambiguous { column, owners } => Rejection::new(
                RejectionKind::AmbiguousColumn,
                format!("ambiguous column '{}' (present in {})", column, owners.join(", ")),
            ),
            Unresolved::StarWithAggregate => Rejection::new(
                RejectionKind::AmbiguousAggregation,
                "'*' cannot be combined with aggregates".to_string(),
            ),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub fixes_applied: Vec<String>,
    pub rejected_reason: Option<String>,
}

/// Result of one validation pass: the (possibly repaired) query, the report,
/// and the rejection when invalid.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub query: CandidateQuery,
    pub report: ValidationReport,
    pub rejection: Option<Rejection>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.report.is_valid
    }
}

pub struct ValidationStage {
    matcher: NameMatcher,
}

impl ValidationStage {
    pub fn new(rename_threshold: f64) -> Self {
        Self {
            matcher: NameMatcher::new(rename_threshold),
        }
    }

    pub fn validate(&self, candidate: &CandidateQuery, snapshot: &MetadataSnapshot) -> ValidationOutcome {
        let mut fixes = Vec::new();
        match self.run(candidate, snapshot, &mut fixes) {
            Ok(query) => {
                if !fixes.is_empty() {
                    info!("Validation applied {} fix(es): {}", fixes.len(), fixes.join("; "));
                }
                ValidationOutcome {
                    query,
                    report: ValidationReport {
                        is_valid: true,
                        fixes_applied: fixes,
                        rejected_reason: None,
                    },
                    rejection: None,
                }
            }
            Err(rejection) => {
                warn!("Validation rejected query: {}", rejection.reason);
                ValidationOutcome {
                    query: candidate.clone(),
                    report: ValidationReport {
                        is_valid: false,
                        fixes_applied: fixes,
                        rejected_reason: Some(rejection.reason.clone()),
                    },
                    rejection: Some(rejection),
                }
            }
        }
    }

    fn run(
        &self,
        candidate: &CandidateQuery,
        snapshot: &MetadataSnapshot,
        fixes: &mut Vec<String>,
    ) -> Result<CandidateQuery, Rejection> {
        check_forbidden(&candidate.raw_text)?;

        let mut query = parse_query(&candidate.raw_text)
            .map_err(|e| Rejection::new(RejectionKind::Malformed, e.to_string()))?;
        let mut resolver = Resolver::repairing(snapshot, &self.matcher);
        let resolved = resolver.run(&mut query);
        let resolution = resolver.finish();
        fixes.extend(resolution.fixes);
        resolved?;

        // An untouched query keeps the text it arrived with.
        let raw_text = if fixes.is_empty() {
            candidate.raw_text.clone()
        } else {
            query.to_string()
        };
        if resolution.aggregates && !candidate.requires_aggregation {
            debug!("requires_aggregation corrected to true");
        }
        Ok(CandidateQuery {
            raw_text,
            referenced_tables: resolution.tables,
            referenced_columns: resolution.columns,
            requires_aggregation: resolution.aggregates,
        })
    }

    /// Text handed back to the generator after a rejection.
    ///
    /// ```text
    /// Rejected: unknown column 'qty' in table 'international_sales'
    /// Did you mean: quantity
    /// Known tables: international_sales, warehouses
    /// Columns of international_sales: sku, region, price, quantity
    /// ```
    pub fn feedback(&self, rejection: &Rejection, candidate: &CandidateQuery, snapshot: &MetadataSnapshot) -> String {
        let mut lines = vec![format!("Rejected: {}", rejection.reason)];
        if !rejection.suggestions.is_empty() {
            lines.push(format!("Did you mean: {}", rejection.suggestions.join(", ")));
        }
        lines.push(format!("Known tables: {}", snapshot.table_names().join(", ")));
        for table in &candidate.referenced_tables {
            if let Some(t) = snapshot.table(table) {
                lines.push(format!("Columns of {}: {}", t.table_name, t.column_names().join(", ")));
            }
        }
        lines.join("\n")
    }
}

/// Forbidden operations are terminal and never repaired.
fn check_forbidden(sql: &str) -> Result<(), Rejection> {
    match check_read_only(sql) {
        Ok(()) => Ok(()),
        Err(GuardViolation::Forbidden { detail }) => {
            debug!("Forbidden SQL: {}", detail);
            Err(Rejection::new(
                RejectionKind::Forbidden,
                WRITE_OPERATION_FORBIDDEN.to_string(),
            ))
        }
        Err(violation @ GuardViolation::Malformed { .. }) => {
            Err(Rejection::new(RejectionKind::Malformed, violation.to_string()))
        }
    }
}
