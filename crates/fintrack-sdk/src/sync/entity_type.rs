//! 实体类型枚举
//!
//! entity_type 为受控枚举，新增需客户端与服务端同步升级。

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 可同步的记账实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Account,
    Transaction,
    Budget,
    Category,
}

/// 默认订阅全部类型的变更流
pub const ALL_ENTITY_TYPES: [EntityType; 4] = [
    EntityType::Account,
    EntityType::Transaction,
    EntityType::Budget,
    EntityType::Category,
];

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Transaction => "transaction",
            Self::Budget => "budget",
            Self::Category => "category",
        }
    }
}

impl FromStr for EntityType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Self::Account),
            "transaction" => Ok(Self::Transaction),
            "budget" => Ok(Self::Budget),
            "category" => Ok(Self::Category),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实体键，用于实体级串行控制与 Outbox 索引
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}
