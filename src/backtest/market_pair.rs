//! Yes/No token pairing for binary markets.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::types::Market;

/// The Yes/No token pair for one condition.
///
/// Selling Yes is equivalent to buying No at `1 - price`, which is what
/// the execution engine uses to express shorts on two-token venues. A
/// *self-pair* (`yes_token_id == no_token_id`) marks a single-ticker
/// market whose book natively carries both sides.
#[derive(Debug, Clone)]
pub struct MarketPair {
    pub condition_id: String,
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
}

impl MarketPair {
    pub fn is_self_pair(&self) -> bool {
        self.yes_token_id == self.no_token_id
    }

    /// The paired token, or `None` when the token is not part of this pair.
    pub fn complement_token(&self, token_id: &str) -> Option<&str> {
        if token_id == self.yes_token_id {
            Some(&self.no_token_id)
        } else if token_id == self.no_token_id {
            Some(&self.yes_token_id)
        } else {
            None
        }
    }

    pub fn complement_price(price: Decimal) -> Decimal {
        dec!(1) - price
    }

    pub fn contains_token(&self, token_id: &str) -> bool {
        token_id == self.yes_token_id || token_id == self.no_token_id
    }
}

/// Lookup of market pairs by condition and token.
#[derive(Debug, Default)]
pub struct MarketPairRegistry {
    pairs: HashMap<String, MarketPair>,
    token_to_condition: HashMap<String, String>,
}

impl MarketPairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pair: MarketPair) {
        self.token_to_condition
            .insert(pair.yes_token_id.clone(), pair.condition_id.clone());
        self.token_to_condition
            .insert(pair.no_token_id.clone(), pair.condition_id.clone());
        debug!(
            condition_id = %pair.condition_id,
            yes_token = %pair.yes_token_id,
            no_token = %pair.no_token_id,
            "registered market pair"
        );
        self.pairs.insert(pair.condition_id.clone(), pair);
    }

    pub fn pair_for_token(&self, token_id: &str) -> Option<&MarketPair> {
        let condition_id = self.token_to_condition.get(token_id)?;
        self.pairs.get(condition_id)
    }

    pub fn pair_by_condition(&self, condition_id: &str) -> Option<&MarketPair> {
        self.pairs.get(condition_id)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Build a registry by grouping markets on `condition_id`.
    ///
    /// A singleton group becomes a self-pair. A group of two pairs up by
    /// outcome label ("yes"/"no"), falling back to outcome index 0/1.
    /// Anything else is skipped with a warning.
    pub fn from_markets<'a, I>(markets: I) -> Self
    where
        I: IntoIterator<Item = &'a Market>,
    {
        let mut registry = Self::new();
        let mut groups: HashMap<&str, Vec<&Market>> = HashMap::new();
        let mut total = 0usize;
        for market in markets {
            total += 1;
            groups.entry(&market.condition_id).or_default().push(market);
        }
        let group_count = groups.len();

        for (condition_id, group) in groups {
            match group.as_slice() {
                [single] => {
                    // Single-ticker market: both sides live on one book, so
                    // the pair points at itself and sells are native.
                    registry.register(MarketPair {
                        condition_id: condition_id.to_string(),
                        question: single.question.clone().unwrap_or_default(),
                        yes_token_id: single.token_id.clone(),
                        no_token_id: single.token_id.clone(),
                    });
                }
                [_, _] => {
                    let mut yes_market: Option<&Market> = None;
                    let mut no_market: Option<&Market> = None;

                    for &market in &group {
                        match market.outcome.as_deref().map(|o| o.trim().to_ascii_lowercase()) {
                            Some(ref o) if o == "yes" => yes_market = Some(market),
                            Some(ref o) if o == "no" => no_market = Some(market),
                            _ => {}
                        }
                        if yes_market.is_none() && market.outcome_index == Some(0) {
                            yes_market = Some(market);
                        } else if no_market.is_none() && market.outcome_index == Some(1) {
                            no_market = Some(market);
                        }
                    }

                    match (yes_market, no_market) {
                        (Some(yes), Some(no)) => registry.register(MarketPair {
                            condition_id: condition_id.to_string(),
                            question: yes.question.clone().unwrap_or_default(),
                            yes_token_id: yes.token_id.clone(),
                            no_token_id: no.token_id.clone(),
                        }),
                        _ => warn!(
                            condition_id = %condition_id,
                            "could not pair outcome tokens, skipping condition"
                        ),
                    }
                }
                other => {
                    warn!(
                        condition_id = %condition_id,
                        token_count = other.len(),
                        "skipping non-binary market"
                    );
                }
            }
        }

        info!(
            total_markets = total,
            total_pairs = registry.len(),
            total_conditions = group_count,
            "market pair registry built"
        );

        registry
    }
}
