use tracing::{debug, warn};

/// Remaining generation budget for one run.
///
/// Built from `n_predict`: a negative value means no limit, zero means the
/// run ends right after the prompt is evaluated. Each sampled token consumes
/// one unit. When a token ends partway through a multi-byte character the
/// controller extends the budget by one so the character can be completed.
///
/// # Examples
///
/// ```rust
/// use llama_completion::stopper::TokenBudget;
///
/// let mut budget = TokenBudget::new(2);
/// budget.consume();
/// assert!(!budget.is_exhausted());
/// budget.consume();
/// assert!(budget.is_exhausted());
///
/// assert!(!TokenBudget::new(-1).is_exhausted());
/// ```
#[derive(Debug, Clone)]
pub struct TokenBudget {
    /// `None` when generation is unlimited.
    limit: Option<usize>,
    remaining: usize,
    consumed: usize,
}

impl TokenBudget {
    pub fn new(n_predict: i32) -> Self {
        let limit = usize::try_from(n_predict).ok();
        match limit {
            Some(0) => debug!("Token budget is 0 - run ends after prompt evaluation"),
            Some(n) if n > 50_000 => warn!(
                "Token budget is very high ({}), consider if this is intentional",
                n
            ),
            Some(n) => debug!("Creating token budget with limit: {} tokens", n),
            None => debug!("Creating unlimited token budget"),
        }
        Self {
            limit,
            remaining: limit.unwrap_or(0),
            consumed: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }

    /// Whether a limited budget has run out.
    pub fn is_exhausted(&self) -> bool {
        self.limit.is_some() && self.remaining == 0
    }

    pub fn consume(&mut self) {
        self.consumed += 1;
        if self.limit.is_some() {
            self.remaining = self.remaining.saturating_sub(1);
        }
    }

    /// Grant one more token, used when the text ends inside a character.
    pub fn extend(&mut self) {
        if self.limit.is_some() {
            self.remaining += 1;
        }
    }

    pub fn remaining(&self) -> Option<usize> {
        self.limit.map(|_| self.remaining)
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }
}
