use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "offer_action", rename_all = "snake_case")]
pub enum OfferAction {
    Accept,
    Reject,
}

impl fmt::Display for OfferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferAction::Accept => f.write_str("accept"),
            OfferAction::Reject => f.write_str("reject"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferLogEntry {
    pub courier_id: Uuid,
    pub order_id: Uuid,
    pub action: OfferAction,
    pub created_at: DateTime<Utc>,
}
