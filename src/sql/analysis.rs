//! Query analysis
//!
//! Scope-aware walk over the `sqlparser` AST. Each `SELECT` block resolves
//! its column references against its own FROM relations first and falls
//! back to enclosing blocks, so correlated subqueries, derived tables and
//! CTEs resolve the way the engine resolves them.
//!
//! Without a catalog the walk only collects references. With one it also
//! repairs the query in place: misspelled tables and columns are renamed,
//! aliases are normalized and incomplete GROUP BY lists are extended.

use crate::error::{GatewayError, Result};
use crate::fuzzy_matcher::NameMatcher;
use crate::metadata::MetadataSnapshot;
use lazy_static::lazy_static;
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, JoinConstraint, JoinOperator, ObjectName,
    OrderByExpr, Query, Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins, Value,
    WindowSpec, WindowType,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

lazy_static! {
    static ref AGGREGATE_FUNCTIONS: HashSet<&'static str> = [
        "SUM", "COUNT", "AVG", "MIN", "MAX", "MEAN", "MEDIAN", "STDDEV", "STDDEV_POP",
        "STDDEV_SAMP", "VARIANCE", "VAR_POP", "VAR_SAMP", "ANY_VALUE", "ARRAY_AGG",
        "STRING_AGG", "LISTAGG", "GROUP_CONCAT", "APPROX_COUNT_DISTINCT", "BOOL_AND",
        "BOOL_OR", "FIRST", "LAST", "MODE", "QUANTILE", "PERCENTILE_CONT",
        "PERCENTILE_DISC", "COUNT_IF", "SUM_IF", "AVG_IF",
    ]
    .into_iter()
    .collect();
}

pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.contains(name.to_uppercase().as_str())
}

/// Parse `sql` as exactly one query statement.
pub fn parse_query(sql: &str) -> Result<Query> {
    let mut statements =
        Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| GatewayError::Sql(e.to_string()))?;
    if statements.len() > 1 {
        return Err(GatewayError::Sql(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    match statements.pop() {
        Some(Statement::Query(query)) => Ok(*query),
        Some(other) => Err(GatewayError::Sql(format!("not a query: {}", other))),
        None => Err(GatewayError::Sql("empty statement".to_string())),
    }
}

/// What the walk found. Tables and columns are lowercase; columns are
/// `table.column` when the owning catalog table is known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub tables: BTreeSet<String>,
    pub columns: BTreeSet<String>,
    /// Some block aggregates or groups.
    pub aggregates: bool,
    pub fixes: Vec<String>,
}

/// A reference the catalog cannot account for.
#[derive(Debug, Clone, PartialEq)]
pub enum Unresolved {
    Table {
        name: String,
        suggestions: Vec<String>,
    },
    Qualifier {
        qualifier: String,
        column: String,
    },
    Column {
        column: String,
        /// Relation the column was qualified with.
        relation: Option<String>,
        suggestions: Vec<String>,
    },
    Ambiguous {
        column: String,
        owners: Vec<String>,
    },
    StarWithAggregate,
}

/// References of a query, without a catalog.
pub fn references(query: &Query) -> Resolution {
    let mut query = query.clone();
    let mut resolver = Resolver::collecting();
    // Nothing is rejected without a catalog.
    let _ = resolver.run(&mut query);
    resolver.finish()
}

/// Key under which a GROUP BY item and a select item are compared.
/// Plain column references compare by column name alone.
pub fn grouping_key(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.to_lowercase(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|p| p.value.to_lowercase())
            .unwrap_or_default(),
        Expr::Nested(inner) => grouping_key(inner),
        other => other.to_string().to_lowercase(),
    }
}

/// Output column names of a query, or `None` when a wildcard hides them.
pub fn output_columns(query: &Query) -> Option<Vec<String>> {
    set_output_columns(&query.body)
}

fn set_output_columns(body: &SetExpr) -> Option<Vec<String>> {
    match body {
        SetExpr::Select(select) => select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.to_lowercase()),
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                    parts.last().map(|p| p.value.to_lowercase())
                }
                SelectItem::UnnamedExpr(other) => Some(other.to_string().to_lowercase()),
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => None,
            })
            .collect(),
        SetExpr::Query(query) => output_columns(query),
        SetExpr::SetOperation { left, .. } => set_output_columns(left),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Relation {
    /// Name columns are qualified with: the alias, else the table name.
    qualifier: String,
    /// Catalog table behind a base relation.
    table: Option<String>,
    /// Lowercase output columns; `None` when they cannot be known.
    columns: Option<Vec<String>>,
}

impl Relation {
    fn opaque(alias: &Option<TableAlias>) -> Self {
        Self {
            qualifier: alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_default(),
            table: None,
            columns: None,
        }
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns
            .as_ref()
            .map(|cols| cols.iter().any(|c| c == column))
            .unwrap_or(false)
    }

    fn label(&self) -> String {
        self.table.clone().unwrap_or_else(|| self.qualifier.clone())
    }
}

/// One query block: its relations and the qualifier rewrites its repairs
/// introduced.
#[derive(Debug, Default)]
struct Scope {
    relations: Vec<Relation>,
    /// Lowercase old qualifier -> new qualifier.
    rewrites: HashMap<String, String>,
    /// Lowercase projection aliases.
    aliases: HashSet<String>,
}

/// Naming state for alias normalization in one block.
struct BlockNames {
    relation_count: usize,
    used: HashSet<String>,
    seen: HashSet<String>,
}

struct Cte {
    name: String,
    columns: Option<Vec<String>>,
}

pub struct Resolver<'a> {
    catalog: Option<(&'a MetadataSnapshot, &'a NameMatcher)>,
    scopes: Vec<Scope>,
    ctes: Vec<Cte>,
    resolution: Resolution,
}

impl<'a> Resolver<'a> {
    /// Collect references only.
    pub fn collecting() -> Self {
        Self {
            catalog: None,
            scopes: Vec::new(),
            ctes: Vec::new(),
            resolution: Resolution::default(),
        }
    }

    /// Resolve against `snapshot`, repairing with `matcher`.
    pub fn repairing(snapshot: &'a MetadataSnapshot, matcher: &'a NameMatcher) -> Self {
        Self {
            catalog: Some((snapshot, matcher)),
            ..Self::collecting()
        }
    }

    pub fn run(&mut self, query: &mut Query) -> std::result::Result<(), Unresolved> {
        self.query(query)
    }

    pub fn finish(self) -> Resolution {
        self.resolution
    }

    fn repairing_mode(&self) -> bool {
        self.catalog.is_some()
    }

    fn fix(&mut self, fix: String) {
        debug!("Repair: {}", fix);
        self.resolution.fixes.push(fix);
    }

    fn record(&mut self, relation: Option<&Relation>, column: &str) {
        match relation {
            Some(Relation { table: Some(table), .. }) => {
                self.resolution
                    .columns
                    .insert(format!("{}.{}", table.to_lowercase(), column.to_lowercase()));
            }
            // Output column of a derived table or CTE.
            Some(_) => {}
            None => {
                self.resolution.columns.insert(column.to_lowercase());
            }
        }
    }

    fn cte(&self, name: &str) -> Option<&Cte> {
        let name = name.to_lowercase();
        self.ctes.iter().rev().find(|c| c.name == name)
    }

    fn query(&mut self, query: &mut Query) -> std::result::Result<(), Unresolved> {
        let cte_mark = self.ctes.len();
        if let Some(with) = query.with.as_mut() {
            let recursive = with.recursive;
            for cte in with.cte_tables.iter_mut() {
                let name = cte.alias.name.value.to_lowercase();
                if recursive {
                    self.ctes.push(Cte {
                        name: name.clone(),
                        columns: None,
                    });
                }
                self.query(&mut cte.query)?;
                let columns = if cte.alias.columns.is_empty() {
                    output_columns(&cte.query)
                } else {
                    Some(cte.alias.columns.iter().map(|c| c.value.to_lowercase()).collect())
                };
                self.ctes.push(Cte { name, columns });
            }
        }

        match query.body.as_mut() {
            SetExpr::Select(select) => self.select(select, &mut query.order_by)?,
            // ORDER BY over a set operation names output columns.
            body => self.set_expr(body)?,
        }
        self.ctes.truncate(cte_mark);
        Ok(())
    }

    fn set_expr(&mut self, body: &mut SetExpr) -> std::result::Result<(), Unresolved> {
        match body {
            SetExpr::Select(select) => self.select(select, &mut []),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left)?;
                self.set_expr(right)
            }
            _ => Ok(()),
        }
    }

    fn select(&mut self, select: &mut Select, order_by: &mut [OrderByExpr]) -> std::result::Result<(), Unresolved> {
        let mut names = self.block_names(&select.from);
        let mut scope = Scope::default();
        for from in select.from.iter_mut() {
            self.from_item(from, &mut scope, &mut names)?;
        }
        scope.aliases = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
                _ => None,
            })
            .collect();
        self.scopes.push(scope);

        for item in select.projection.iter_mut() {
            self.select_item(item)?;
        }
        for from in select.from.iter_mut() {
            self.join_constraints(from)?;
        }
        if let Some(selection) = select.selection.as_mut() {
            self.expr(selection, false)?;
        }
        if let GroupByExpr::Expressions(exprs) = &mut select.group_by {
            for expr in exprs.iter_mut() {
                self.expr(expr, true)?;
            }
        }
        if let Some(having) = select.having.as_mut() {
            self.expr(having, true)?;
        }
        if let Some(qualify) = select.qualify.as_mut() {
            self.expr(qualify, true)?;
        }
        for window in select.named_window.iter_mut() {
            self.window_spec(&mut window.1, true)?;
        }
        for item in order_by.iter_mut() {
            self.expr(&mut item.expr, true)?;
        }

        self.scopes.pop();
        self.aggregation(select)
    }

    /// Relation count and every name already taken in a block, including
    /// the qualifiers of enclosing blocks.
    fn block_names(&self, from: &[TableWithJoins]) -> BlockNames {
        fn visit(factor: &TableFactor, count: &mut usize, used: &mut HashSet<String>) {
            match factor {
                TableFactor::NestedJoin { table_with_joins, .. } => {
                    visit(&table_with_joins.relation, count, used);
                    for join in &table_with_joins.joins {
                        visit(&join.relation, count, used);
                    }
                }
                TableFactor::Table { name, alias, .. } => {
                    *count += 1;
                    if let Some(last) = name.0.last() {
                        used.insert(last.value.to_lowercase());
                    }
                    if let Some(alias) = alias {
                        used.insert(alias.name.value.to_lowercase());
                    }
                }
                TableFactor::Derived { alias, .. }
                | TableFactor::TableFunction { alias, .. }
                | TableFactor::Function { alias, .. }
                | TableFactor::UNNEST { alias, .. }
                | TableFactor::Pivot { alias, .. }
                | TableFactor::Unpivot { alias, .. } => {
                    *count += 1;
                    if let Some(alias) = alias {
                        used.insert(alias.name.value.to_lowercase());
                    }
                }
            }
        }

        let mut relation_count = 0;
        let mut used: HashSet<String> = self
            .scopes
            .iter()
            .flat_map(|s| s.relations.iter().map(|r| r.qualifier.to_lowercase()))
            .collect();
        for item in from {
            visit(&item.relation, &mut relation_count, &mut used);
            for join in &item.joins {
                visit(&join.relation, &mut relation_count, &mut used);
            }
        }
        BlockNames {
            relation_count,
            used,
            seen: HashSet::new(),
        }
    }

    fn from_item(
        &mut self,
        item: &mut TableWithJoins,
        scope: &mut Scope,
        names: &mut BlockNames,
    ) -> std::result::Result<(), Unresolved> {
        self.relation(&mut item.relation, scope, names)?;
        for join in item.joins.iter_mut() {
            self.relation(&mut join.relation, scope, names)?;
        }
        Ok(())
    }

    fn relation(
        &mut self,
        factor: &mut TableFactor,
        scope: &mut Scope,
        names: &mut BlockNames,
    ) -> std::result::Result<(), Unresolved> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let written = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                if name.0.len() == 1 {
                    if let Some(cte) = self.cte(&written) {
                        let relation = Relation {
                            qualifier: alias.as_ref().map(|a| a.name.value.clone()).unwrap_or(written),
                            table: None,
                            columns: cte.columns.clone(),
                        };
                        if let Some(alias) = alias.as_ref() {
                            names.seen.insert(alias.name.value.to_lowercase());
                        }
                        scope.relations.push(relation);
                        return Ok(());
                    }
                }

                let table = self.base_table(&written)?;
                if table != written {
                    if let Some(last) = name.0.last_mut() {
                        last.value = table.clone();
                    }
                    if alias.is_none() {
                        scope.rewrites.insert(written.to_lowercase(), table.clone());
                    }
                }
                self.resolution.tables.insert(table.to_lowercase());
                if self.repairing_mode() {
                    self.normalize_alias(&written, &table, alias, scope, names);
                }

                let columns = self
                    .catalog
                    .and_then(|(snapshot, _)| snapshot.table(&table))
                    .map(|t| t.column_names().iter().map(|c| c.to_lowercase()).collect());
                scope.relations.push(Relation {
                    qualifier: alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_else(|| table.clone()),
                    table: Some(table),
                    columns,
                });
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
            } => {
                if *lateral {
                    self.scopes.push(Scope {
                        relations: scope.relations.clone(),
                        ..Scope::default()
                    });
                }
                let walked = self.query(subquery);
                if *lateral {
                    self.scopes.pop();
                }
                walked?;

                let columns = match alias {
                    Some(a) if !a.columns.is_empty() => Some(a.columns.iter().map(|c| c.value.to_lowercase()).collect()),
                    _ => output_columns(subquery),
                };
                if let Some(alias) = alias.as_ref() {
                    names.seen.insert(alias.name.value.to_lowercase());
                }
                scope.relations.push(Relation {
                    qualifier: alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_default(),
                    table: None,
                    columns,
                });
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.from_item(table_with_joins, scope, names)?;
            }
            TableFactor::TableFunction { alias, .. }
            | TableFactor::Function { alias, .. }
            | TableFactor::UNNEST { alias, .. }
            | TableFactor::Pivot { alias, .. }
            | TableFactor::Unpivot { alias, .. } => {
                scope.relations.push(Relation::opaque(alias));
            }
        }
        Ok(())
    }

    /// A catalog table, renamed to its closest match when misspelled.
    fn base_table(&mut self, written: &str) -> std::result::Result<String, Unresolved> {
        let Some((snapshot, matcher)) = self.catalog else {
            return Ok(written.to_string());
        };
        if snapshot.table(written).is_some() {
            return Ok(written.to_string());
        }
        let known = snapshot.table_names();
        match matcher.best_match(written, known.iter().copied()) {
            Some((best, score)) => {
                debug!("Table '{}' -> '{}' ({:.2})", written, best, score);
                let best = best.to_string();
                self.fix(format!("table '{}' renamed to '{}'", written, best));
                Ok(best)
            }
            None => Err(Unresolved::Table {
                name: written.to_string(),
                suggestions: matcher
                    .suggestions(written, known.iter().copied(), 3)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }),
        }
    }

    /// Duplicate aliases within a block are renamed; in blocks with several
    /// relations every table gets an alias. New aliases are the first letter
    /// of the table name, with `2`, `3`, ... appended on collision.
    fn normalize_alias(
        &mut self,
        written: &str,
        table: &str,
        alias: &mut Option<TableAlias>,
        scope: &mut Scope,
        names: &mut BlockNames,
    ) {
        match alias {
            Some(existing) => {
                let key = existing.name.value.to_lowercase();
                if names.seen.insert(key) {
                    return;
                }
                let fresh = next_alias(table, &names.used);
                names.used.insert(fresh.clone());
                names.seen.insert(fresh.clone());
                self.fix(format!(
                    "duplicate alias '{}' on table '{}' renamed to '{}'",
                    existing.name.value, table, fresh
                ));
                existing.name = Ident::new(fresh);
            }
            None if names.relation_count > 1 => {
                let fresh = next_alias(table, &names.used);
                names.used.insert(fresh.clone());
                names.seen.insert(fresh.clone());
                self.fix(format!("alias '{}' added for table '{}'", fresh, table));
                scope.rewrites.insert(written.to_lowercase(), fresh.clone());
                scope.rewrites.insert(table.to_lowercase(), fresh.clone());
                *alias = Some(TableAlias {
                    name: Ident::new(fresh),
                    columns: Vec::new(),
                });
            }
            None => {
                names.seen.insert(table.to_lowercase());
            }
        }
    }

    fn select_item(&mut self, item: &mut SelectItem) -> std::result::Result<(), Unresolved> {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => self.expr(expr, false),
            SelectItem::QualifiedWildcard(name, _) => self.star_qualifier(name),
            SelectItem::Wildcard(_) => Ok(()),
        }
    }

    fn star_qualifier(&mut self, name: &mut ObjectName) -> std::result::Result<(), Unresolved> {
        let Some(qualifier) = name.0.last_mut() else {
            return Ok(());
        };
        match self.lookup_qualifier(&qualifier.value) {
            Some((rewritten, _)) => {
                qualifier.value = rewritten;
                Ok(())
            }
            None if !self.repairing_mode() => Ok(()),
            None => Err(Unresolved::Qualifier {
                qualifier: qualifier.value.clone(),
                column: "*".to_string(),
            }),
        }
    }

    /// Find the relation a qualifier names, innermost block first, applying
    /// that block's rewrites. Returns the qualifier as it should be written.
    fn lookup_qualifier(&self, qualifier: &str) -> Option<(String, Relation)> {
        let key = qualifier.to_lowercase();
        self.scopes.iter().rev().find_map(|scope| {
            let written = scope.rewrites.get(&key).cloned().unwrap_or_else(|| qualifier.to_string());
            scope
                .relations
                .iter()
                .find(|r| !r.qualifier.is_empty() && r.qualifier.eq_ignore_ascii_case(&written))
                .map(|r| (written, r.clone()))
        })
    }

    fn join_constraints(&mut self, item: &mut TableWithJoins) -> std::result::Result<(), Unresolved> {
        if let TableFactor::NestedJoin { table_with_joins, .. } = &mut item.relation {
            self.join_constraints(table_with_joins)?;
        }
        for join in item.joins.iter_mut() {
            if let TableFactor::NestedJoin { table_with_joins, .. } = &mut join.relation {
                self.join_constraints(table_with_joins)?;
            }
            if let Some(JoinConstraint::On(expr)) = constraint_mut(&mut join.join_operator) {
                self.expr(expr, false)?;
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &mut Expr, aliases: bool) -> std::result::Result<(), Unresolved> {
        match expr {
            Expr::Identifier(ident) => self.unqualified(ident, aliases),
            Expr::CompoundIdentifier(parts) => self.qualified(parts),
            Expr::Subquery(query) | Expr::ArraySubquery(query) | Expr::Exists { subquery: query, .. } => {
                self.query(query)
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr, aliases)?;
                self.query(subquery)
            }
            Expr::Function(function) => self.function(function, aliases),
            Expr::BinaryOp { left, right, .. }
            | Expr::AnyOp { left, right, .. }
            | Expr::AllOp { left, right, .. }
            | Expr::IsDistinctFrom(left, right)
            | Expr::IsNotDistinctFrom(left, right)
            | Expr::Like {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::ILike {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::SimilarTo {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::RLike {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::Position { expr: left, r#in: right }
            | Expr::AggregateExpressionWithFilter {
                expr: left,
                filter: right,
            }
            | Expr::InUnnest {
                expr: left,
                array_expr: right,
                ..
            } => {
                self.expr(left, aliases)?;
                self.expr(right, aliases)
            }
            Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsUnknown(inner)
            | Expr::IsNotUnknown(inner)
            | Expr::Nested(inner)
            | Expr::UnaryOp { expr: inner, .. }
            | Expr::Cast { expr: inner, .. }
            | Expr::TryCast { expr: inner, .. }
            | Expr::SafeCast { expr: inner, .. }
            | Expr::AtTimeZone { timestamp: inner, .. }
            | Expr::Extract { expr: inner, .. }
            | Expr::Ceil { expr: inner, .. }
            | Expr::Floor { expr: inner, .. }
            | Expr::Collate { expr: inner, .. }
            | Expr::CompositeAccess { expr: inner, .. }
            | Expr::Named { expr: inner, .. }
            | Expr::JsonAccess { left: inner, .. }
            | Expr::MapAccess { column: inner, .. } => self.expr(inner, aliases),
            Expr::InList { expr, list, .. } => {
                self.expr(expr, aliases)?;
                self.exprs(list, aliases)
            }
            Expr::Between { expr, low, high, .. } => {
                self.expr(expr, aliases)?;
                self.expr(low, aliases)?;
                self.expr(high, aliases)
            }
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                self.expr(expr, aliases)?;
                if let Some(from) = substring_from {
                    self.expr(from, aliases)?;
                }
                if let Some(len) = substring_for {
                    self.expr(len, aliases)?;
                }
                Ok(())
            }
            Expr::Trim {
                expr,
                trim_what,
                trim_characters,
                ..
            } => {
                self.expr(expr, aliases)?;
                if let Some(what) = trim_what {
                    self.expr(what, aliases)?;
                }
                if let Some(characters) = trim_characters {
                    self.exprs(characters, aliases)?;
                }
                Ok(())
            }
            Expr::Overlay {
                expr,
                overlay_what,
                overlay_from,
                overlay_for,
            } => {
                self.expr(expr, aliases)?;
                self.expr(overlay_what, aliases)?;
                self.expr(overlay_from, aliases)?;
                if let Some(len) = overlay_for {
                    self.expr(len, aliases)?;
                }
                Ok(())
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.expr(operand, aliases)?;
                }
                self.exprs(conditions, aliases)?;
                self.exprs(results, aliases)?;
                if let Some(other) = else_result {
                    self.expr(other, aliases)?;
                }
                Ok(())
            }
            Expr::ListAgg(agg) => {
                self.expr(&mut agg.expr, aliases)?;
                for item in agg.within_group.iter_mut() {
                    self.expr(&mut item.expr, aliases)?;
                }
                Ok(())
            }
            Expr::ArrayAgg(agg) => {
                self.expr(&mut agg.expr, aliases)?;
                if let Some(order_by) = agg.order_by.as_mut() {
                    for item in order_by.iter_mut() {
                        self.expr(&mut item.expr, aliases)?;
                    }
                }
                Ok(())
            }
            Expr::GroupingSets(sets) | Expr::Cube(sets) | Expr::Rollup(sets) => {
                for set in sets.iter_mut() {
                    self.exprs(set, aliases)?;
                }
                Ok(())
            }
            Expr::Tuple(items) | Expr::Struct { values: items, .. } => self.exprs(items, aliases),
            Expr::ArrayIndex { obj, indexes } => {
                self.expr(obj, aliases)?;
                self.exprs(indexes, aliases)
            }
            Expr::Array(array) => self.exprs(&mut array.elem, aliases),
            Expr::Interval(interval) => self.expr(&mut interval.value, aliases),
            _ => Ok(()),
        }
    }

    fn exprs(&mut self, exprs: &mut [Expr], aliases: bool) -> std::result::Result<(), Unresolved> {
        for expr in exprs.iter_mut() {
            self.expr(expr, aliases)?;
        }
        Ok(())
    }

    fn function(&mut self, function: &mut Function, aliases: bool) -> std::result::Result<(), Unresolved> {
        for arg in function.args.iter_mut() {
            let arg = match arg {
                FunctionArg::Named { arg, .. } => arg,
                FunctionArg::Unnamed(arg) => arg,
            };
            if let FunctionArgExpr::Expr(expr) = arg {
                self.expr(expr, aliases)?;
            }
        }
        if let Some(filter) = function.filter.as_mut() {
            self.expr(filter, aliases)?;
        }
        if let Some(WindowType::WindowSpec(spec)) = function.over.as_mut() {
            self.window_spec(spec, aliases)?;
        }
        for item in function.order_by.iter_mut() {
            self.expr(&mut item.expr, aliases)?;
        }
        Ok(())
    }

    fn window_spec(&mut self, spec: &mut WindowSpec, aliases: bool) -> std::result::Result<(), Unresolved> {
        self.exprs(&mut spec.partition_by, aliases)?;
        for item in spec.order_by.iter_mut() {
            self.expr(&mut item.expr, aliases)?;
        }
        Ok(())
    }

    /// `q.column`: the qualifier must name a relation in this block or an
    /// enclosing one, and the column must exist in it.
    fn qualified(&mut self, parts: &mut [Ident]) -> std::result::Result<(), Unresolved> {
        let n = parts.len();
        if n < 2 {
            return Ok(());
        }
        let column = parts[n - 1].value.clone();
        let Some((qualifier, relation)) = self.lookup_qualifier(&parts[n - 2].value) else {
            if !self.repairing_mode() {
                return Ok(());
            }
            return Err(Unresolved::Qualifier {
                qualifier: parts[n - 2].value.clone(),
                column,
            });
        };
        parts[n - 2].value = qualifier.clone();

        let lowered = column.to_lowercase();
        let Some(known) = relation.columns.as_ref() else {
            self.record(Some(&relation), &column);
            return Ok(());
        };
        if relation.has_column(&lowered) || !self.repairing_mode() {
            self.record(Some(&relation), &column);
            return Ok(());
        }

        let Some((_, matcher)) = self.catalog else {
            return Ok(());
        };
        match matcher.best_match(&column, known.iter().map(String::as_str)) {
            Some((best, _)) => {
                let best = best.to_string();
                self.fix(format!(
                    "column '{}.{}' renamed to '{}.{}'",
                    qualifier, column, qualifier, best
                ));
                parts[n - 1].value = best.clone();
                self.record(Some(&relation), &best);
                Ok(())
            }
            None => Err(Unresolved::Column {
                column: column.clone(),
                relation: Some(relation.label()),
                suggestions: matcher
                    .suggestions(&column, known.iter().map(String::as_str), 3)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }),
        }
    }

    /// A bare column resolves in the innermost block that can own it. A
    /// block whose relations hide their columns accepts any name.
    fn unqualified(&mut self, ident: &mut Ident, aliases: bool) -> std::result::Result<(), Unresolved> {
        let column = ident.value.to_lowercase();
        if aliases
            && self
                .scopes
                .last()
                .map(|s| s.aliases.contains(&column))
                .unwrap_or(false)
        {
            return Ok(());
        }

        for depth in (0..self.scopes.len()).rev() {
            let scope = &self.scopes[depth];
            let owners: Vec<Relation> = scope.relations.iter().filter(|r| r.has_column(&column)).cloned().collect();
            if owners.len() == 1 {
                self.record(owners.first(), &column);
                return Ok(());
            }
            if owners.len() > 1 {
                if !self.repairing_mode() {
                    self.record(None, &column);
                    return Ok(());
                }
                return Err(Unresolved::Ambiguous {
                    column: ident.value.clone(),
                    owners: owners.iter().map(Relation::label).collect(),
                });
            }
            if scope.relations.iter().any(|r| r.columns.is_none()) {
                let single = match scope.relations.as_slice() {
                    [only] if only.table.is_some() => Some(only.clone()),
                    _ => None,
                };
                self.record(single.as_ref(), &column);
                return Ok(());
            }
        }

        let Some((_, matcher)) = self.catalog else {
            self.record(None, &column);
            return Ok(());
        };
        let relations: Vec<Relation> = self.scopes.last().map(|s| s.relations.clone()).unwrap_or_default();
        let candidates: BTreeSet<&str> = relations
            .iter()
            .flat_map(|r| r.columns.iter().flatten().map(String::as_str))
            .collect();
        match matcher.best_match(&ident.value, candidates.iter().copied()) {
            Some((best, _)) => {
                let owners: Vec<&Relation> = relations.iter().filter(|r| r.has_column(best)).collect();
                if owners.len() > 1 {
                    return Err(Unresolved::Ambiguous {
                        column: best.to_string(),
                        owners: owners.iter().map(|r| r.label()).collect(),
                    });
                }
                let best = best.to_string();
                self.fix(format!("column '{}' renamed to '{}'", ident.value, best));
                ident.value = best.clone();
                self.record(owners.first().copied(), &best);
                Ok(())
            }
            None => Err(Unresolved::Column {
                column: ident.value.clone(),
                relation: None,
                suggestions: matcher
                    .suggestions(&ident.value, candidates.iter().copied(), 3)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }),
        }
    }

    /// Aggregated blocks group every plain select item. `*` cannot be
    /// combined with aggregates.
    fn aggregation(&mut self, select: &mut Select) -> std::result::Result<(), Unresolved> {
        let grouped = match &select.group_by {
            GroupByExpr::All => true,
            GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
        };
        let aggregated = select
            .projection
            .iter()
            .any(|item| item_expr(item).map(|e| traits(e).aggregate).unwrap_or(false));
        if grouped || aggregated {
            self.resolution.aggregates = true;
        }
        if !aggregated || !self.repairing_mode() {
            return Ok(());
        }

        if select
            .projection
            .iter()
            .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)))
        {
            return Err(Unresolved::StarWithAggregate);
        }

        let GroupByExpr::Expressions(group) = &mut select.group_by else {
            return Ok(());
        };
        let keys: Vec<String> = group.iter().map(grouping_key).collect();
        let missing: Vec<Expr> = select
            .projection
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| {
                let (expr, alias) = match item {
                    SelectItem::UnnamedExpr(expr) => (expr, None),
                    SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.to_lowercase())),
                    _ => return None,
                };
                let t = traits(expr);
                if t.aggregate || t.window || !t.column {
                    return None;
                }
                let key = grouping_key(expr);
                let ordinal = (pos + 1).to_string();
                let covered = keys
                    .iter()
                    .any(|k| *k == key || Some(k) == alias.as_ref() || *k == ordinal);
                if covered {
                    None
                } else {
                    Some(expr.clone())
                }
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let list = missing.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ");
        let fix = if group.is_empty() {
            format!("GROUP BY {} added", list)
        } else {
            format!("GROUP BY extended with {}", list)
        };
        group.extend(missing);
        self.fix(fix);
        Ok(())
    }
}

fn constraint_mut(op: &mut JoinOperator) -> Option<&mut JoinConstraint> {
    match op {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c) => Some(c),
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

fn item_expr(item: &SelectItem) -> Option<&Expr> {
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
        _ => None,
    }
}

fn next_alias(table_name: &str, used: &HashSet<String>) -> String {
    let base = table_name
        .chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase().to_string())
        .unwrap_or_else(|| "t".to_string());
    if !used.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}{}", base, n);
        if !used.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// What an expression contains, not looking into subqueries.
#[derive(Debug, Default, Clone, Copy)]
struct ExprTraits {
    aggregate: bool,
    window: bool,
    column: bool,
}

fn traits(expr: &Expr) -> ExprTraits {
    let mut acc = ExprTraits::default();
    collect_traits(expr, &mut acc);
    acc
}

fn collect_traits(expr: &Expr, acc: &mut ExprTraits) {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => acc.column = true,
        // A subquery may be correlated; never constant.
        Expr::Subquery(_) | Expr::ArraySubquery(_) | Expr::Exists { .. } => acc.column = true,
        Expr::InSubquery { expr, .. } => {
            acc.column = true;
            collect_traits(expr, acc);
        }
        Expr::Function(function) => {
            let name = function.name.0.last().map(|i| i.value.as_str()).unwrap_or_default();
            if function.over.is_some() {
                acc.window = true;
            } else if is_aggregate_function(name) {
                acc.aggregate = true;
            }
            for arg in &function.args {
                let arg = match arg {
                    FunctionArg::Named { arg, .. } => arg,
                    FunctionArg::Unnamed(arg) => arg,
                };
                if let FunctionArgExpr::Expr(e) = arg {
                    collect_traits(e, acc);
                }
            }
        }
        Expr::ListAgg(_) | Expr::ArrayAgg(_) | Expr::AggregateExpressionWithFilter { .. } => acc.aggregate = true,
        Expr::BinaryOp { left, right, .. }
        | Expr::AnyOp { left, right, .. }
        | Expr::AllOp { left, right, .. }
        | Expr::IsDistinctFrom(left, right)
        | Expr::IsNotDistinctFrom(left, right)
        | Expr::Like {
            expr: left,
            pattern: right,
            ..
        }
        | Expr::ILike {
            expr: left,
            pattern: right,
            ..
        } => {
            collect_traits(left, acc);
            collect_traits(right, acc);
        }
        Expr::IsFalse(inner)
        | Expr::IsNotFalse(inner)
        | Expr::IsTrue(inner)
        | Expr::IsNotTrue(inner)
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::Nested(inner)
        | Expr::UnaryOp { expr: inner, .. }
        | Expr::Cast { expr: inner, .. }
        | Expr::TryCast { expr: inner, .. }
        | Expr::SafeCast { expr: inner, .. }
        | Expr::Extract { expr: inner, .. }
        | Expr::Ceil { expr: inner, .. }
        | Expr::Floor { expr: inner, .. }
        | Expr::Collate { expr: inner, .. }
        | Expr::Substring { expr: inner, .. }
        | Expr::Trim { expr: inner, .. } => collect_traits(inner, acc),
        Expr::InList { expr, list, .. } => {
            collect_traits(expr, acc);
            list.iter().for_each(|e| collect_traits(e, acc));
        }
        Expr::Between { expr, low, high, .. } => {
            collect_traits(expr, acc);
            collect_traits(low, acc);
            collect_traits(high, acc);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            operand.iter().for_each(|e| collect_traits(e, acc));
            conditions.iter().chain(results.iter()).for_each(|e| collect_traits(e, acc));
            else_result.iter().for_each(|e| collect_traits(e, acc));
        }
        Expr::Tuple(items) => items.iter().for_each(|e| collect_traits(e, acc)),
        // Anything else either is a literal or wraps columns; treat the
        // unknown shapes as column-bearing so they are grouped.
        Expr::Value(_) | Expr::TypedString { .. } | Expr::IntroducedString { .. } | Expr::Interval(_) => {}
        _ => acc.column = true,
    }
}

/// A numeric literal, as `LIMIT` values are written.
pub fn number_literal(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_accepts_one_select_only() {
        assert!(parse_query("SELECT region FROM international_sales;").is_ok());
        assert!(parse_query("SELECT 1; SELECT 2").is_err());
        assert!(parse_query("DELETE FROM t").is_err());
        assert!(parse_query("SELEC region").is_err());
    }

    #[test]
    fn test_references_without_catalog() {
        let query = parse_query("SELECT region, SUM(price) FROM International_Sales GROUP BY region").unwrap();
        let found = references(&query);
        assert_eq!(found.tables.iter().collect::<Vec<_>>(), vec!["international_sales"]);
        assert!(found.columns.contains("international_sales.region"));
        assert!(found.columns.contains("international_sales.price"));
        assert!(found.aggregates);
        assert!(found.fixes.is_empty());
    }

    #[test]
    fn test_references_follow_subquery_scopes() {
        let query = parse_query(
            "SELECT s.city FROM stores s WHERE s.region IN (SELECT region FROM international_sales WHERE price > 5)",
        )
        .unwrap();
        let found = references(&query);
        assert!(found.columns.contains("stores.city"));
        assert!(found.columns.contains("international_sales.region"));
        assert!(found.columns.contains("international_sales.price"));
        assert!(!found.aggregates);
    }

    #[test]
    fn test_cte_outputs_are_not_catalog_columns() {
        let query = parse_query(
            "WITH r AS (SELECT region, SUM(price) AS total FROM international_sales GROUP BY region) SELECT total FROM r",
        )
        .unwrap();
        let found = references(&query);
        assert_eq!(found.tables.iter().collect::<Vec<_>>(), vec!["international_sales"]);
        assert!(!found.columns.contains("total"));
        assert!(found.aggregates);
    }

    #[test]
    fn test_output_columns() {
        let query = parse_query("SELECT sku, t.region, SUM(price) AS total FROM t").unwrap();
        assert_eq!(
            output_columns(&query),
            Some(vec!["sku".to_string(), "region".to_string(), "total".to_string()])
        );
        let query = parse_query("SELECT * FROM t").unwrap();
        assert_eq!(output_columns(&query), None);
    }

    #[test]
    fn test_grouping_key_and_traits() {
        let query = parse_query("SELECT i.region, ROUND(SUM(price), 2), 1, RANK() OVER (ORDER BY sku) FROM t i").unwrap();
        let SetExpr::Select(select) = query.body.as_ref() else {
            panic!("expected a select");
        };
        let exprs: Vec<&Expr> = select.projection.iter().filter_map(item_expr).collect();
        assert_eq!(grouping_key(exprs[0]), "region");
        assert!(traits(exprs[1]).aggregate);
        assert!(!traits(exprs[2]).column);
        assert!(traits(exprs[3]).window);
        assert!(!traits(exprs[3]).aggregate);
    }

    #[test]
    fn test_next_alias() {
        let used: HashSet<String> = ["s".to_string(), "s2".to_string()].into_iter().collect();
        assert_eq!(next_alias("stores", &used), "s3");
        assert_eq!(next_alias("international_sales", &used), "i");
    }
}
