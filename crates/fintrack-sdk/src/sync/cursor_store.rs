//! 同步游标 - Cursor Key 规范
//!
//! 格式：sync_cursor:{entity_type}
//! 值为该类型变更流最后一个已处理事件的 sequence，恢复订阅时从其后继续。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::EntityType;

const PREFIX: &str = "sync_cursor";

/// 各实体类型的 last_sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursors {
    positions: BTreeMap<EntityType, u64>,
}

impl SyncCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(entity_type: EntityType) -> String {
        format!("{}:{}", PREFIX, entity_type.as_str())
    }

    pub fn key_prefix() -> String {
        format!("{}:", PREFIX)
    }

    /// 未同步过的类型返回 0
    pub fn get(&self, entity_type: EntityType) -> u64 {
        self.positions.get(&entity_type).copied().unwrap_or(0)
    }

    /// 只前进不后退；返回是否发生前进
    pub fn advance(&mut self, entity_type: EntityType, sequence: u64) -> bool {
        let current = self.positions.entry(entity_type).or_insert(0);
        if sequence > *current {
            *current = sequence;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityType, u64)> + '_ {
        self.positions.iter().map(|(t, s)| (*t, *s))
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_key_format() {
        assert_eq!(SyncCursors::key(EntityType::Transaction), "sync_cursor:transaction");
        assert_eq!(SyncCursors::key(EntityType::Budget), "sync_cursor:budget");
        assert!(SyncCursors::key(EntityType::Account).starts_with(&SyncCursors::key_prefix()));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cursors = SyncCursors::new();
        assert_eq!(cursors.get(EntityType::Budget), 0);
        assert!(cursors.advance(EntityType::Budget, 5));
        assert!(!cursors.advance(EntityType::Budget, 3));
        assert!(!cursors.advance(EntityType::Budget, 5));
        assert_eq!(cursors.get(EntityType::Budget), 5);
        assert_eq!(cursors.get(EntityType::Account), 0);
    }
}
