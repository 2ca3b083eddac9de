//! # Trust policy
//!
//! The category classifier and policy table behind `shouldConnectTo`
//! (SPEC_FULL.md §4.9). Kept as a closed enum and an exhaustive `match`
//! rather than a runtime-configurable rules engine: every category this
//! crate will ever see is named here, so the compiler enforces that every
//! preset and every call site handles all seven.

use std::fmt;

/// The four bits of knowledge the classifier decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustFacts {
    /// This exact public key has been seen before, under some name.
    pub known_key: bool,
    /// This exact key is bound to the name the peer is presenting now.
    pub known_name: bool,
    /// Count of *other* names this key is also bound to.
    pub aliases: usize,
    /// A *different* key is already bound to the name the peer is using.
    pub other_key_for_name: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustCategory {
    /// Known key, known name, no aliases: exactly who they say they are.
    TheOneAndOnly,
    /// Known key bound to this name, but also bound to other names.
    KnownWithKnownAliases,
    /// Known key, not bound to this name, bound to exactly one other name,
    /// and nothing else claims this name: looks like a rename.
    PossibleNameChange,
    /// Known key, not bound to this name, bound to several other names,
    /// and nothing else claims this name: one key shared across names.
    PossibleSharedPubKey,
    /// Known key, not bound to this name, bound to other names, *and*
    /// this name is already claimed by a different key.
    NameSwapCollision,
    /// Unknown key, this name is already bound to a different key.
    Pretender,
    /// Unknown key, this name is unclaimed.
    NeverMet,
}

impl TrustCategory {
    pub const ALL: [TrustCategory; 7] = [
        TrustCategory::TheOneAndOnly,
        TrustCategory::KnownWithKnownAliases,
        TrustCategory::PossibleNameChange,
        TrustCategory::PossibleSharedPubKey,
        TrustCategory::NameSwapCollision,
        TrustCategory::Pretender,
        TrustCategory::NeverMet,
    ];
}

impl fmt::Display for TrustCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustCategory::TheOneAndOnly => "theoneandonly",
            TrustCategory::KnownWithKnownAliases => "knownwithknownaliases",
            TrustCategory::PossibleNameChange => "possiblenamechange",
            TrustCategory::PossibleSharedPubKey => "possiblesharedpubkey",
            TrustCategory::NameSwapCollision => "nameswapcollision",
            TrustCategory::Pretender => "pretender",
            TrustCategory::NeverMet => "nevermet",
        };
        f.write_str(s)
    }
}

/// Derives the category from the four knowledge bits.
pub fn classify(facts: TrustFacts) -> TrustCategory {
    match (facts.known_key, facts.known_name, facts.aliases > 0, facts.other_key_for_name) {
        (true, true, false, _) => TrustCategory::TheOneAndOnly,
        (true, true, true, _) => TrustCategory::KnownWithKnownAliases,
        (true, false, false, false) => TrustCategory::PossibleNameChange,
        (true, false, true, false) => TrustCategory::PossibleSharedPubKey,
        (true, false, _, true) => TrustCategory::NameSwapCollision,
        (false, false, _, true) => TrustCategory::Pretender,
        (false, false, _, false) => TrustCategory::NeverMet,
        // known_key implies the classifier above should have matched; a
        // key cannot be both unknown and bound under the presented name.
        (false, true, _, _) => TrustCategory::NeverMet,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Reject,
    PromptAndTrust,
    ConnectAndPrompt,
    ConnectAndTrust,
}

/// What `shouldConnectTo` tells the caller to do. The actual prompting UI
/// is outside this crate's scope; this only says whether to proceed and
/// whether a decision still needs to be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    Deny,
    /// Connect right away. `auto_trust` is true for `connectandtrust`
    /// (no further decision needed) and false for `connectandprompt`
    /// (the application should still be asked, asynchronously).
    ConnectImmediately { auto_trust: bool },
    /// Ask the application before connecting at all.
    PromptBeforeConnecting,
}

/// Maps every category to a trust level. Built from one of the named
/// presets or by hand via [`TrustPolicy::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustPolicy {
    levels: [TrustLevel; 7],
}

impl TrustPolicy {
    pub fn new(
        the_one_and_only: TrustLevel,
        known_with_known_aliases: TrustLevel,
        possible_name_change: TrustLevel,
        possible_shared_pub_key: TrustLevel,
        name_swap_collision: TrustLevel,
        pretender: TrustLevel,
        never_met: TrustLevel,
    ) -> TrustPolicy {
        TrustPolicy {
            levels: [
                the_one_and_only,
                known_with_known_aliases,
                possible_name_change,
                possible_shared_pub_key,
                name_swap_collision,
                pretender,
                never_met,
            ],
        }
    }

    pub fn level_for(&self, category: TrustCategory) -> TrustLevel {
        self.levels[category as usize]
    }

    pub fn decide(&self, category: TrustCategory) -> ConnectDecision {
        match self.level_for(category) {
            TrustLevel::Reject => ConnectDecision::Deny,
            TrustLevel::PromptAndTrust => ConnectDecision::PromptBeforeConnecting,
            TrustLevel::ConnectAndPrompt => ConnectDecision::ConnectImmediately { auto_trust: false },
            TrustLevel::ConnectAndTrust => ConnectDecision::ConnectImmediately { auto_trust: true },
        }
    }

    /// Blocks on a decision before connecting (`strict`, `alwaysprompt`),
    /// prompts after connecting rather than the application (`strict`
    /// flavors ending "andquiet"), or never prompts at all.
    pub fn alwaysprompt() -> TrustPolicy {
        use TrustLevel::PromptAndTrust as P;
        TrustPolicy::new(P, P, P, P, P, P, P)
    }

    pub fn strict() -> TrustPolicy {
        use TrustLevel::{PromptAndTrust as P, Reject as R};
        TrustPolicy::new(TrustLevel::ConnectAndTrust, P, P, P, R, R, P)
    }

    pub fn strictandquiet() -> TrustPolicy {
        use TrustLevel::{ConnectAndPrompt as C, Reject as R};
        TrustPolicy::new(TrustLevel::ConnectAndTrust, C, C, C, R, R, C)
    }

    pub fn moderate() -> TrustPolicy {
        use TrustLevel::{ConnectAndPrompt as C, PromptAndTrust as P, Reject as R};
        TrustPolicy::new(TrustLevel::ConnectAndTrust, C, C, C, P, R, TrustLevel::ConnectAndTrust)
    }

    pub fn moderateandquiet() -> TrustPolicy {
        use TrustLevel::{ConnectAndPrompt as C, Reject as R};
        TrustPolicy::new(TrustLevel::ConnectAndTrust, C, C, C, C, R, TrustLevel::ConnectAndTrust)
    }

    pub fn lax() -> TrustPolicy {
        use TrustLevel::{ConnectAndPrompt as C, ConnectAndTrust as T, PromptAndTrust as P};
        TrustPolicy::new(T, T, T, T, C, P, T)
    }

    pub fn unsafe_() -> TrustPolicy {
        let t = TrustLevel::ConnectAndTrust;
        TrustPolicy::new(t, t, t, t, t, t, t)
    }

    pub fn rejectall() -> TrustPolicy {
        let r = TrustLevel::Reject;
        TrustPolicy::new(r, r, r, r, r, r, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(known_key: bool, known_name: bool, aliases: usize, other_key_for_name: bool) -> TrustFacts {
        TrustFacts { known_key, known_name, aliases, other_key_for_name }
    }

    #[test]
    fn classifies_every_row_of_the_decision_table() {
        assert_eq!(classify(facts(true, true, 0, false)), TrustCategory::TheOneAndOnly);
        assert_eq!(classify(facts(true, true, 1, false)), TrustCategory::KnownWithKnownAliases);
        assert_eq!(classify(facts(true, false, 0, false)), TrustCategory::PossibleNameChange);
        assert_eq!(classify(facts(true, false, 1, false)), TrustCategory::PossibleSharedPubKey);
        assert_eq!(classify(facts(true, false, 1, true)), TrustCategory::NameSwapCollision);
        assert_eq!(classify(facts(false, false, 0, true)), TrustCategory::Pretender);
        assert_eq!(classify(facts(false, false, 0, false)), TrustCategory::NeverMet);
    }

    #[test]
    fn rejectall_denies_everything() {
        let policy = TrustPolicy::rejectall();
        for category in TrustCategory::ALL {
            assert_eq!(policy.decide(category), ConnectDecision::Deny);
        }
    }

    #[test]
    fn unsafe_preset_trusts_everything_without_prompting() {
        let policy = TrustPolicy::unsafe_();
        for category in TrustCategory::ALL {
            assert_eq!(policy.decide(category), ConnectDecision::ConnectImmediately { auto_trust: true });
        }
    }

    #[test]
    fn strict_rejects_impersonation_attempts() {
        let policy = TrustPolicy::strict();
        assert_eq!(policy.decide(TrustCategory::NameSwapCollision), ConnectDecision::Deny);
        assert_eq!(policy.decide(TrustCategory::Pretender), ConnectDecision::Deny);
        assert_eq!(
            policy.decide(TrustCategory::TheOneAndOnly),
            ConnectDecision::ConnectImmediately { auto_trust: true }
        );
    }

    #[test]
    fn quiet_presets_never_block_before_connecting() {
        for policy in [TrustPolicy::strictandquiet(), TrustPolicy::moderateandquiet()] {
            for category in TrustCategory::ALL {
                assert_ne!(policy.decide(category), ConnectDecision::PromptBeforeConnecting);
            }
        }
    }
}
