use crate::error::{EngineError, EngineResult};
use crate::types::{Token, TokenId, TokenStatus};
use std::collections::HashMap;

/// All tokens of one run, in creation order
#[derive(Debug, Default, Clone)]
pub struct TokenTable {
    tokens: HashMap<TokenId, Token>,
    order: Vec<TokenId>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: Token) -> TokenId {
        let id = token.id;
        if self.tokens.insert(id, token).is_none() {
            self.order.push(id);
        }
        id
    }

    pub fn get(&self, id: &TokenId) -> Option<&Token> {
        self.tokens.get(id)
    }

    pub fn require(&self, id: &TokenId) -> EngineResult<&Token> {
        self.tokens.get(id).ok_or(EngineError::TokenNotFound(*id))
    }

    pub fn require_mut(&mut self, id: &TokenId) -> EngineResult<&mut Token> {
        self.tokens.get_mut(id).ok_or(EngineError::TokenNotFound(*id))
    }

    pub fn set_status(&mut self, id: &TokenId, status: TokenStatus) -> EngineResult<TokenStatus> {
        let token = self.require_mut(id)?;
        let previous = token.status;
        token.status = status;
        tracing::trace!("Token {} {:?} -> {:?}", id, previous, status);
        Ok(previous)
    }

    pub fn status(&self, id: &TokenId) -> Option<TokenStatus> {
        self.tokens.get(id).map(|t| t.status)
    }

    pub fn is_live(&self, id: &TokenId) -> bool {
        self.status(id).is_some_and(|s| s.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.tokens.values().filter(|t| t.status.is_live()).count()
    }

    /// Whether any live token other than `id` remains
    pub fn others_live(&self, id: &TokenId) -> bool {
        self.tokens
            .values()
            .any(|t| t.id != *id && t.status.is_live())
    }

    pub fn live_ids(&self) -> Vec<TokenId> {
        self.order
            .iter()
            .filter(|id| self.is_live(id))
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.order.iter().filter_map(|id| self.tokens.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn test_liveness_tracking() {
        let mut table = TokenTable::new();
        let first = table.insert(Token::new(NodeId::new("a"), vec![]));
        let second = table.insert(Token::new(NodeId::new("b"), vec![]));

        assert_eq!(table.live_count(), 2);
        assert!(table.others_live(&first));

        let previous = table.set_status(&second, TokenStatus::Cancelled).unwrap();
        assert_eq!(previous, TokenStatus::Created);
        assert!(!table.others_live(&first));
        assert_eq!(table.live_ids(), vec![first]);
        assert_eq!(table.len(), 2);

        let missing = TokenId::new();
        assert!(matches!(
            table.set_status(&missing, TokenStatus::Active),
            Err(EngineError::TokenNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn test_iteration_follows_creation_order() {
        let mut table = TokenTable::new();
        let ids: Vec<TokenId> = (0..5)
            .map(|i| table.insert(Token::new(NodeId::new(format!("n{i}")), vec![])))
            .collect();
        let iterated: Vec<TokenId> = table.iter().map(|t| t.id).collect();
        assert_eq!(iterated, ids);
    }
}
