//! Entity descriptors: one table per entity type, described as data
//!
//! A descriptor names the table, its key columns, the endpoint it is
//! paginated from, and how camelCase JSON fields map to snake_case columns.
//! The fetcher, the storage layer and the orchestrators are written once
//! against `EntityDescriptor` instead of once per entity.

use super::client::Api;
use super::db::Row;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// How a JSON field is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Real,
    Integer,
    /// Stored as 0/1
    Bool,
    /// Arrays and objects stored as JSON text; strings kept verbatim
    Json,
}

/// One JSON field -> column mapping
///
/// `field` is a dotted path; numeric segments index into arrays
/// (`events.0.id` reads the first embedded event's id).
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub field: &'static str,
    pub column: &'static str,
    pub kind: ColumnKind,
}

const fn col(field: &'static str, column: &'static str, kind: ColumnKind) -> Column {
    Column {
        field,
        column,
        kind,
    }
}

use ColumnKind::{Bool, Integer, Json, Real, Text};

/// Everything the generic ingestion path needs to know about one entity type
#[derive(Debug)]
pub struct EntityDescriptor {
    /// Human-readable name used in logs and reports
    pub name: &'static str,
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
    pub api: Api,
    /// Collection endpoint; detail endpoint is `{endpoint}/{id}`
    pub endpoint: &'static str,
    /// Fixed query parameters sent with every page
    pub query: &'static [(&'static str, &'static str)],
    pub columns: &'static [Column],
}

impl EntityDescriptor {
    /// Map one API record to a row
    ///
    /// Every mapped column is present; absent fields become NULL.
    /// `fetched_at` is stamped with the current time.
    pub fn to_row(&self, record: &Value) -> Row {
        let mut row: Row = self
            .columns
            .iter()
            .map(|c| (c.column.to_string(), convert(lookup(record, c.field), c.kind)))
            .collect();
        row.insert(
            "fetched_at".to_string(),
            SqlValue::Integer(chrono::Utc::now().timestamp()),
        );
        row
    }

    /// Map records, dropping those without a complete key
    pub fn to_rows(&self, records: &[Value]) -> Vec<Row> {
        let rows: Vec<Row> = records.iter().map(|r| self.to_row(r)).collect();
        let total = rows.len();
        let keyed: Vec<Row> = rows.into_iter().filter(|r| self.is_keyed(r)).collect();
        if keyed.len() < total {
            log::debug!(
                "   ├─ {}: skipped {} records without key",
                self.name,
                total - keyed.len()
            );
        }
        keyed
    }

    /// True when every key column holds a non-null value
    pub fn is_keyed(&self, row: &Row) -> bool {
        self.key_columns.iter().all(|k| match row.get(*k) {
            None | Some(SqlValue::Null) => false,
            Some(SqlValue::Text(s)) => !s.is_empty(),
            Some(_) => true,
        })
    }

    /// External id of a record, read through the first key column's field
    pub fn id_of(&self, record: &Value) -> Option<String> {
        let key = self.key_columns.first()?;
        let column = self.columns.iter().find(|c| c.column == *key)?;
        match lookup(record, column.field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn detail_path(&self, id: &str) -> String {
        format!("{}/{}", self.endpoint, id)
    }
}

/// Resolve a dotted path inside a JSON value
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Null => None,
        v => Some(v),
    }
}

fn convert(value: Option<&Value>, kind: ColumnKind) -> SqlValue {
    let Some(value) = value else {
        return SqlValue::Null;
    };

    match kind {
        Text => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Number(n) => SqlValue::Text(n.to_string()),
            Value::Bool(b) => SqlValue::Text(b.to_string()),
            other => SqlValue::Text(other.to_string()),
        },
        Real => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(SqlValue::Real)
                .unwrap_or(SqlValue::Null),
            Value::Bool(b) => SqlValue::Real(if *b { 1.0 } else { 0.0 }),
            _ => SqlValue::Null,
        },
        Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(SqlValue::Integer)
                .unwrap_or(SqlValue::Null),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .unwrap_or(SqlValue::Null),
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            _ => SqlValue::Null,
        },
        Bool => match value {
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            Value::Number(n) => SqlValue::Integer((n.as_f64().unwrap_or(0.0) != 0.0) as i64),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" => SqlValue::Integer(1),
                "false" | "0" => SqlValue::Integer(0),
                _ => SqlValue::Null,
            },
            _ => SqlValue::Null,
        },
        Json => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
    }
}

pub static EVENTS: EntityDescriptor = EntityDescriptor {
    name: "events",
    table: "events",
    key_columns: &["id"],
    api: Api::Gamma,
    endpoint: "/events",
    query: &[("closed", "false"), ("order", "volume"), ("ascending", "false")],
    columns: &[
        col("id", "id", Text),
        col("ticker", "ticker", Text),
        col("slug", "slug", Text),
        col("title", "title", Text),
        col("description", "description", Text),
        col("startDate", "start_date", Text),
        col("creationDate", "creation_date", Text),
        col("endDate", "end_date", Text),
        col("image", "image", Text),
        col("icon", "icon", Text),
        col("liquidity", "liquidity", Real),
        col("volume", "volume", Real),
        col("volume24hr", "volume_24hr", Real),
        col("volume1wk", "volume_1wk", Real),
        col("volume1mo", "volume_1mo", Real),
        col("openInterest", "open_interest", Real),
        col("competitive", "competitive", Real),
        col("commentCount", "comment_count", Integer),
        col("active", "active", Bool),
        col("closed", "closed", Bool),
        col("archived", "archived", Bool),
        col("featured", "featured", Bool),
        col("restricted", "restricted", Bool),
        col("enableNegRisk", "enable_neg_risk", Bool),
        col("createdAt", "created_at", Text),
        col("updatedAt", "updated_at", Text),
    ],
};

pub static MARKETS: EntityDescriptor = EntityDescriptor {
    name: "markets",
    table: "markets",
    key_columns: &["id"],
    api: Api::Gamma,
    endpoint: "/markets",
    query: &[("closed", "false"), ("order", "volume"), ("ascending", "false")],
    columns: &[
        col("id", "id", Text),
        // Overridden with the owning event when the market arrives embedded
        col("events.0.id", "event_id", Text),
        col("question", "question", Text),
        col("conditionId", "condition_id", Text),
        col("slug", "slug", Text),
        col("description", "description", Text),
        col("startDate", "start_date", Text),
        col("endDate", "end_date", Text),
        col("image", "image", Text),
        col("icon", "icon", Text),
        col("outcomes", "outcomes", Json),
        col("outcomePrices", "outcome_prices", Json),
        col("clobTokenIds", "clob_token_ids", Json),
        col("liquidity", "liquidity", Real),
        col("volume", "volume", Real),
        col("volume24hr", "volume_24hr", Real),
        col("volume1wk", "volume_1wk", Real),
        col("lastTradePrice", "last_trade_price", Real),
        col("bestBid", "best_bid", Real),
        col("bestAsk", "best_ask", Real),
        col("spread", "spread", Real),
        col("oneDayPriceChange", "one_day_price_change", Real),
        col("competitive", "competitive", Real),
        col("active", "active", Bool),
        col("closed", "closed", Bool),
        col("archived", "archived", Bool),
        col("restricted", "restricted", Bool),
        col("createdAt", "created_at", Text),
        col("updatedAt", "updated_at", Text),
    ],
};

pub static SERIES: EntityDescriptor = EntityDescriptor {
    name: "series",
    table: "series",
    key_columns: &["id"],
    api: Api::Gamma,
    endpoint: "/series",
    query: &[("order", "volume"), ("ascending", "false"), ("include_chat", "true")],
    columns: &[
        col("id", "id", Text),
        col("ticker", "ticker", Text),
        col("slug", "slug", Text),
        col("title", "title", Text),
        col("subtitle", "subtitle", Text),
        col("seriesType", "series_type", Text),
        col("recurrence", "recurrence", Text),
        col("description", "description", Text),
        col("image", "image", Text),
        col("icon", "icon", Text),
        col("active", "active", Bool),
        col("closed", "closed", Bool),
        col("archived", "archived", Bool),
        col("featured", "featured", Bool),
        col("restricted", "restricted", Bool),
        col("volume", "volume", Real),
        col("volume24hr", "volume_24hr", Real),
        col("liquidity", "liquidity", Real),
        col("commentCount", "comment_count", Integer),
        col("createdAt", "created_at", Text),
        col("updatedAt", "updated_at", Text),
    ],
};

pub static TAGS: EntityDescriptor = EntityDescriptor {
    name: "tags",
    table: "tags",
    key_columns: &["id"],
    api: Api::Gamma,
    endpoint: "/tags",
    query: &[],
    columns: &[
        col("id", "id", Integer),
        col("label", "label", Text),
        col("slug", "slug", Text),
        col("forceShow", "force_show", Bool),
        col("forceHide", "force_hide", Bool),
        col("isCarousel", "is_carousel", Bool),
        col("publishedAt", "published_at", Text),
        col("createdAt", "created_at", Text),
        col("updatedAt", "updated_at", Text),
    ],
};

pub static COLLECTIONS: EntityDescriptor = EntityDescriptor {
    name: "collections",
    table: "collections",
    key_columns: &["id"],
    api: Api::Gamma,
    endpoint: "/collections",
    query: &[],
    columns: &[
        col("id", "id", Text),
        col("ticker", "ticker", Text),
        col("slug", "slug", Text),
        col("title", "title", Text),
        col("subtitle", "subtitle", Text),
        col("collectionType", "collection_type", Text),
        col("description", "description", Text),
        col("image", "image", Text),
        col("icon", "icon", Text),
        col("active", "active", Bool),
        col("closed", "closed", Bool),
        col("archived", "archived", Bool),
        col("createdAt", "created_at", Text),
        col("updatedAt", "updated_at", Text),
    ],
};

pub static COMMENTS: EntityDescriptor = EntityDescriptor {
    name: "comments",
    table: "comments",
    key_columns: &["id"],
    api: Api::Gamma,
    endpoint: "/comments",
    query: &[("order", "createdAt"), ("ascending", "false"), ("get_positions", "true")],
    columns: &[
        col("id", "id", Text),
        col("body", "body", Text),
        col("parentEntityType", "parent_entity_type", Text),
        col("parentEntityID", "parent_entity_id", Text),
        col("parentCommentID", "parent_comment_id", Text),
        col("userAddress", "user_address", Text),
        col("replyAddress", "reply_address", Text),
        col("reportCount", "report_count", Integer),
        col("reactionCount", "reaction_count", Integer),
        col("profile.name", "profile_name", Text),
        col("profile.pseudonym", "profile_pseudonym", Text),
        col("createdAt", "created_at", Text),
        col("updatedAt", "updated_at", Text),
    ],
};

pub static COMMENT_REACTIONS: EntityDescriptor = EntityDescriptor {
    name: "comment reactions",
    table: "comment_reactions",
    key_columns: &["comment_id", "proxy_wallet", "reaction_type"],
    api: Api::Gamma,
    endpoint: "/comments",
    query: &[],
    columns: &[
        col("commentID", "comment_id", Text),
        col("userAddress", "proxy_wallet", Text),
        col("reactionType", "reaction_type", Text),
        col("icon", "icon", Text),
        col("createdAt", "created_at", Text),
    ],
};

pub static USER_TRADES: EntityDescriptor = EntityDescriptor {
    name: "trades",
    table: "user_trades",
    key_columns: &["transaction_hash"],
    api: Api::Data,
    endpoint: "/trades",
    query: &[("takerOnly", "false")],
    columns: &[
        col("transactionHash", "transaction_hash", Text),
        col("proxyWallet", "proxy_wallet", Text),
        col("side", "side", Text),
        col("asset", "asset", Text),
        col("conditionId", "condition_id", Text),
        col("size", "size", Real),
        col("price", "price", Real),
        col("timestamp", "timestamp", Integer),
        col("title", "title", Text),
        col("slug", "slug", Text),
        col("outcome", "outcome", Text),
        col("outcomeIndex", "outcome_index", Integer),
    ],
};

pub static USER_ACTIVITY: EntityDescriptor = EntityDescriptor {
    name: "activity",
    table: "user_activity",
    key_columns: &["transaction_hash"],
    api: Api::Data,
    endpoint: "/activity",
    query: &[],
    columns: &[
        col("transactionHash", "transaction_hash", Text),
        col("proxyWallet", "proxy_wallet", Text),
        col("timestamp", "timestamp", Integer),
        col("conditionId", "condition_id", Text),
        col("type", "type", Text),
        col("side", "side", Text),
        col("size", "size", Real),
        col("usdcSize", "usdc_size", Real),
        col("price", "price", Real),
        col("asset", "asset", Text),
        col("outcomeIndex", "outcome_index", Integer),
        col("title", "title", Text),
        col("slug", "slug", Text),
        col("outcome", "outcome", Text),
    ],
};

pub static CURRENT_POSITIONS: EntityDescriptor = EntityDescriptor {
    name: "current positions",
    table: "user_positions_current",
    key_columns: &["proxy_wallet", "asset"],
    api: Api::Data,
    endpoint: "/positions",
    query: &[("sizeThreshold", "1"), ("sortBy", "TOKENS"), ("sortDirection", "DESC")],
    columns: &[
        col("proxyWallet", "proxy_wallet", Text),
        col("asset", "asset", Text),
        col("conditionId", "condition_id", Text),
        col("size", "size", Real),
        col("avgPrice", "avg_price", Real),
        col("initialValue", "initial_value", Real),
        col("currentValue", "current_value", Real),
        col("cashPnl", "cash_pnl", Real),
        col("percentPnl", "percent_pnl", Real),
        col("totalBought", "total_bought", Real),
        col("realizedPnl", "realized_pnl", Real),
        col("curPrice", "cur_price", Real),
        col("title", "title", Text),
        col("slug", "slug", Text),
        col("outcome", "outcome", Text),
        col("outcomeIndex", "outcome_index", Integer),
        col("endDate", "end_date", Text),
    ],
};

pub static CLOSED_POSITIONS: EntityDescriptor = EntityDescriptor {
    name: "closed positions",
    table: "user_positions_closed",
    key_columns: &["proxy_wallet", "asset", "closed_at"],
    api: Api::Data,
    endpoint: "/closed-positions",
    query: &[("sortBy", "REALIZEDPNL"), ("sortDirection", "DESC")],
    columns: &[
        col("proxyWallet", "proxy_wallet", Text),
        col("asset", "asset", Text),
        col("timestamp", "closed_at", Text),
        col("conditionId", "condition_id", Text),
        col("avgPrice", "avg_price", Real),
        col("totalBought", "total_bought", Real),
        col("realizedPnl", "realized_pnl", Real),
        col("curPrice", "cur_price", Real),
        col("title", "title", Text),
        col("slug", "slug", Text),
        col("outcome", "outcome", Text),
        col("outcomeIndex", "outcome_index", Integer),
    ],
};

pub static TRANSACTIONS: EntityDescriptor = EntityDescriptor {
    name: "transactions",
    table: "transactions",
    key_columns: &["transaction_hash"],
    api: Api::Data,
    endpoint: "/trades",
    query: &[("takerOnly", "false")],
    columns: &[
        col("transactionHash", "transaction_hash", Text),
        col("conditionId", "condition_id", Text),
        col("proxyWallet", "proxy_wallet", Text),
        col("side", "side", Text),
        col("asset", "asset", Text),
        col("size", "size", Real),
        col("price", "price", Real),
        col("usdcSize", "usdc_size", Real),
        col("timestamp", "timestamp", Integer),
    ],
};
