//! Sanitizer trait and the ordered chain the sanitize stage runs.
//!
//! Sanitizers are external collaborators: PII scrubbing, injection
//! detection and the like live outside this crate. The chain only fixes the
//! order they run in and stops at the first failure, which is propagated
//! verbatim.

use crate::error::SanitizeError;
use crate::segment::Segment;

/// A single sanitization step.
pub trait Sanitizer: Send + Sync {
    /// Unique name (e.g., "length_guard").
    fn name(&self) -> &str;

    /// Return the cleaned segment, or fail the build.
    ///
    /// Implementations must keep the segment id; use [`Segment::with_content`].
    fn sanitize(&self, segment: Segment) -> Result<Segment, SanitizeError>;
}

/// Ordered sequence of sanitizers, applied front to back.
#[derive(Default)]
pub struct SanitizerChain {
    sanitizers: Vec<Box<dyn Sanitizer>>,
}

impl SanitizerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain holding just the default [`LengthGuard`].
    pub fn with_defaults(max_chars: usize) -> Self {
        let mut chain = Self::new();
        chain.register(Box::new(LengthGuard::new(max_chars)));
        chain
    }

    /// Append a sanitizer to the end of the chain.
    pub fn register(&mut self, sanitizer: Box<dyn Sanitizer>) {
        self.sanitizers.push(sanitizer);
    }

    pub fn names(&self) -> Vec<&str> {
        self.sanitizers.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.sanitizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sanitizers.is_empty()
    }

    /// Run every sanitizer in order.
    pub fn apply(&self, segment: Segment) -> Result<Segment, SanitizeError> {
        self.sanitizers
            .iter()
            .try_fold(segment, |segment, sanitizer| sanitizer.sanitize(segment))
    }
}

impl std::fmt::Debug for SanitizerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanitizerChain")
            .field("sanitizers", &self.names())
            .finish()
    }
}

/// Truncates content longer than `max_chars` characters.
#[derive(Debug, Clone)]
pub struct LengthGuard {
    max_chars: usize,
}

impl LengthGuard {
    pub const DEFAULT_MAX_CHARS: usize = 50_000;

    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for LengthGuard {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CHARS)
    }
}

impl Sanitizer for LengthGuard {
    fn name(&self) -> &str {
        "length_guard"
    }

    fn sanitize(&self, segment: Segment) -> Result<Segment, SanitizeError> {
        match segment.content().char_indices().nth(self.max_chars) {
            Some((cut, _)) => {
                let truncated = segment.content()[..cut].to_string();
                Ok(segment.with_content(truncated))
            }
            None => Ok(segment),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Redact(&'static str);

    impl Sanitizer for Redact {
        fn name(&self) -> &str {
            "redact"
        }
        fn sanitize(&self, segment: Segment) -> Result<Segment, SanitizeError> {
            let cleaned = segment.content().replace(self.0, "[redacted]");
            Ok(segment.with_content(cleaned))
        }
    }

    struct RejectAll;

    impl Sanitizer for RejectAll {
        fn name(&self) -> &str {
            "reject_all"
        }
        fn sanitize(&self, segment: Segment) -> Result<Segment, SanitizeError> {
            Err(SanitizeError::Rejected {
                segment_id: segment.id().clone(),
                sanitizer: self.name().into(),
                reason: "nope".into(),
            })
        }
    }

    #[test]
    fn length_guard_truncates_on_char_boundary() {
        let guard = LengthGuard::new(3);
        let seg = Segment::rag("héllo");
        let out = guard.sanitize(seg.clone()).unwrap();
        assert_eq!(out.content(), "hél");
        assert_eq!(out.id(), seg.id());
    }

    #[test]
    fn length_guard_passes_short_content_untouched() {
        let guard = LengthGuard::default();
        let seg = Segment::rag("short").with_token_count(2);
        let out = guard.sanitize(seg.clone()).unwrap();
        assert_eq!(out, seg);
    }

    #[test]
    fn chain_runs_in_registration_order() {
        let mut chain = SanitizerChain::new();
        chain.register(Box::new(Redact("secret")));
        chain.register(Box::new(LengthGuard::new(10)));
        assert_eq!(chain.names(), vec!["redact", "length_guard"]);
        let out = chain.apply(Segment::message("secret plans")).unwrap();
        assert_eq!(out.content(), "[redacted]");
    }

    #[test]
    fn chain_stops_at_first_failure() {
        let mut chain = SanitizerChain::new();
        chain.register(Box::new(RejectAll));
        chain.register(Box::new(Redact("x")));
        let seg = Segment::message("x");
        let err = chain.apply(seg.clone()).unwrap_err();
        assert_eq!(err.segment_id(), seg.id());
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = SanitizerChain::new();
        assert!(chain.is_empty());
        let seg = Segment::message("unchanged");
        assert_eq!(chain.apply(seg.clone()).unwrap(), seg);
    }
}
