use tl_core::pipeline::steps;
use tl_core::types::Finding;

/// Decision for one pass of a `review` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    /// No findings; continue after the review step.
    Approved,
    /// Findings to address; `retry_count` is the new cycle count.
    Retry { retry_count: u32 },
    /// Findings remain and the attempt cap is reached.
    CapExceeded { cap: u32 },
}

/// Bounded review -> fix loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewLoop {
    /// `None` means the loop never gives up.
    pub max_attempts: Option<u32>,
}

impl ReviewLoop {
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self { max_attempts }
    }

    /// `retry_count` is the number of fix cycles already consumed, so this
    /// review is attempt `retry_count + 1`.
    pub fn evaluate(&self, findings: &[Finding], retry_count: u32) -> ReviewVerdict {
        if findings.is_empty() {
            return ReviewVerdict::Approved;
        }
        let attempt = retry_count + 1;
        match self.max_attempts {
            Some(cap) if attempt >= cap => ReviewVerdict::CapExceeded { cap },
            _ => ReviewVerdict::Retry {
                retry_count: attempt,
            },
        }
    }
}

pub fn cap_message(cap: u32) -> String {
    format!("Review loop exceeded max_review_attempts ({cap})")
}

/// Index to resume at after an `implement_fix` step.
///
/// When `implement` precedes `review` the fix replaces it, so execution picks
/// up with the step after `implement`; otherwise the review is simply rerun.
pub fn fix_reentry_index(template: &[String]) -> Option<usize> {
    let review = template.iter().position(|s| s == steps::REVIEW)?;
    match template.iter().position(|s| s == steps::IMPLEMENT) {
        Some(implement) if implement < review => Some(implement + 1),
        _ => Some(review),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(steps: &[&str]) -> Vec<String> {
        steps.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_findings_approve() {
        let review = ReviewLoop::new(Some(1));
        assert_eq!(review.evaluate(&[], 7), ReviewVerdict::Approved);
    }

    #[test]
    fn unbounded_loop_keeps_retrying() {
        let review = ReviewLoop::default();
        let findings = [Finding::new("nit")];
        assert_eq!(
            review.evaluate(&findings, 41),
            ReviewVerdict::Retry { retry_count: 42 }
        );
    }

    #[test]
    fn cap_of_two_allows_two_reviews() {
        let review = ReviewLoop::new(Some(2));
        let findings = [Finding::new("bug")];
        assert_eq!(
            review.evaluate(&findings, 0),
            ReviewVerdict::Retry { retry_count: 1 }
        );
        assert_eq!(
            review.evaluate(&findings, 1),
            ReviewVerdict::CapExceeded { cap: 2 }
        );
        assert_eq!(
            cap_message(2),
            "Review loop exceeded max_review_attempts (2)"
        );
    }

    #[test]
    fn reentry_after_implement() {
        let feature = template(&["plan", "plan_impl", "implement", "verify", "review", "commit"]);
        assert_eq!(fix_reentry_index(&feature), Some(3));
    }

    #[test]
    fn reentry_without_implement_reruns_review() {
        let review_only = template(&["analyze", "review", "report"]);
        assert_eq!(fix_reentry_index(&review_only), Some(1));
        assert_eq!(fix_reentry_index(&template(&["verify", "report"])), None);
    }
}
