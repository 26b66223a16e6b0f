//! Inbound message classification.
//!
//! Group messages drive the compliance state machine through exactly one of
//! three recognized tags; everything else is ordinary chatter that only
//! proves the member still exists.

/// Classification of an inbound group message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    /// Qualifying activity report; resets the compliance window.
    Proof,
    /// Leave announcement; freezes the countdown.
    LeaveStart,
    /// Return announcement; resumes the frozen countdown.
    LeaveEnd,
    /// Any other message.
    Other,
}

impl SignalKind {
    /// Short label for logs and the audit trail.
    pub fn label(self) -> &'static str {
        match self {
            SignalKind::Proof => "proof",
            SignalKind::LeaveStart => "leave_start",
            SignalKind::LeaveEnd => "leave_end",
            SignalKind::Other => "message",
        }
    }
}

/// The recognized tags, held lowercase so matching is case-insensitive.
#[derive(Clone, Debug)]
pub struct SignalTags {
    proof: String,
    leave_start: String,
    leave_end: String,
}

impl SignalTags {
    pub fn new(proof: &str, leave_start: &str, leave_end: &str) -> Self {
        Self {
            proof: proof.to_lowercase(),
            leave_start: leave_start.to_lowercase(),
            leave_end: leave_end.to_lowercase(),
        }
    }

    /// Classify message text by tag containment.
    ///
    /// A message carrying several tags resolves by fixed precedence:
    /// proof > leave-end > leave-start.
    pub fn classify(&self, text: &str) -> SignalKind {
        let lower = text.to_lowercase();
        if lower.contains(&self.proof) {
            SignalKind::Proof
        } else if lower.contains(&self.leave_end) {
            SignalKind::LeaveEnd
        } else if lower.contains(&self.leave_start) {
            SignalKind::LeaveStart
        } else {
            SignalKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> SignalTags {
        SignalTags::new("#report", "#away", "#back")
    }

    #[test]
    fn classifies_each_tag() {
        let t = tags();
        assert_eq!(t.classify("done for today #report"), SignalKind::Proof);
        assert_eq!(t.classify("#away until monday"), SignalKind::LeaveStart);
        assert_eq!(t.classify("#back, what did I miss"), SignalKind::LeaveEnd);
        assert_eq!(t.classify("good morning"), SignalKind::Other);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let t = tags();
        assert_eq!(t.classify("#REPORT"), SignalKind::Proof);
        assert_eq!(t.classify("heading #Away for a bit"), SignalKind::LeaveStart);
    }

    #[test]
    fn containment_matches_mid_text() {
        let t = tags();
        assert_eq!(
            t.classify("week 3 summary: 4 sessions #report🔥"),
            SignalKind::Proof
        );
    }

    #[test]
    fn precedence_proof_over_everything() {
        let t = tags();
        assert_eq!(t.classify("#back and #report"), SignalKind::Proof);
        assert_eq!(t.classify("#away but here is my #report"), SignalKind::Proof);
    }

    #[test]
    fn precedence_leave_end_over_leave_start() {
        let t = tags();
        assert_eq!(t.classify("#back (was #away)"), SignalKind::LeaveEnd);
    }

    #[test]
    fn empty_text_is_other() {
        assert_eq!(tags().classify(""), SignalKind::Other);
    }
}
