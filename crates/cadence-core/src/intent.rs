use std::sync::OnceLock;

use regex::Regex;

use cadence_types::{ConflictPolicy, Intent, IntentResult};

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub approve_threshold: f64,
    pub confirm_threshold: f64,
    pub conflict_policy: ConflictPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            approve_threshold: 0.85,
            confirm_threshold: 0.60,
            conflict_policy: ConflictPolicy::DenyOverApprove,
        }
    }
}

/// Any non-top intent scoring above this is reported as conflicting.
const CONFLICT_FLOOR: f64 = 0.3;

struct LexiconEntry {
    intent: Intent,
    weight: f64,
    positives: Vec<Regex>,
    negatives: Vec<Regex>,
}

struct Lexicon {
    entries: Vec<LexiconEntry>,
}

fn patterns(raw: &[&str]) -> Vec<Regex> {
    raw.iter()
        .map(|p| Regex::new(p).expect("intent pattern"))
        .collect()
}

/// Bilingual cue table. Deny is weighted above approve so mixed signals
/// err toward safety; negatives subtract at double weight.
fn lexicon() -> &'static Lexicon {
    static LEXICON: OnceLock<Lexicon> = OnceLock::new();
    LEXICON.get_or_init(|| Lexicon {
        entries: vec![
            LexiconEntry {
                intent: Intent::Approve,
                weight: 1.0,
                positives: patterns(&[
                    r"\bapproved?\b",
                    r"\blgtm\b",
                    r"\blooks good\b",
                    r"\bgo ahead\b",
                    r"\bproceed\b",
                    r"\bship it\b",
                    r"\bsounds good\b",
                    r"\byes\b",
                    r"\bconfirm\b",
                    r"\bgreen light\b",
                    r"\bonayla\b",
                    r"\bonayl[ıi]yorum\b",
                    r"\bkabul\b",
                    r"\btamam\b",
                    r"\bba[şs]la\b",
                    r"\bba[şs]layal[ıi]m\b",
                    r"\bdevam et\b",
                    r"\bevet\b",
                    r"\buygun\b",
                ]),
                negatives: patterns(&[
                    r"\b(don'?t|do not|never|cannot|can'?t)\s+(approve|proceed|ship)\b",
                    r"\bnot\s+approved?\b",
                    r"\bonaylam[ıi]yorum\b",
                    r"\bonaylama\b",
                ]),
            },
            LexiconEntry {
                intent: Intent::Revise,
                weight: 1.0,
                positives: patterns(&[
                    r"\brevise\b",
                    r"\brework\b",
                    r"\bchange\b",
                    r"\bupdate\b",
                    r"\badjust\b",
                    r"\bmodify\b",
                    r"\btweak\b",
                    r"\binstead\b",
                    r"\bde[ğg]i[şs]tir\w*\b",
                    r"\bd[üu]zenle\w*\b",
                    r"\brevize\b",
                    r"\bg[üu]ncelle\w*\b",
                    r"\byeniden\b",
                ]),
                negatives: Vec::new(),
            },
            LexiconEntry {
                intent: Intent::Ask,
                weight: 0.8,
                positives: patterns(&[
                    r"\bwhy\b",
                    r"\bhow\b",
                    r"\bwhat\b",
                    r"\bexplain\b",
                    r"\bclarify\b",
                    r"\bquestion\b",
                    r"\?",
                    r"\btell me more\b",
                    r"\bneden\b",
                    r"\bni[çc]in\b",
                    r"\bnas[ıi]l\b",
                    r"\bne demek\b",
                    r"\ba[çc][ıi]kla\b",
                    r"\bsoru\b",
                ]),
                negatives: Vec::new(),
            },
            LexiconEntry {
                intent: Intent::Deny,
                weight: 1.2,
                positives: patterns(&[
                    r"\bdeny\b",
                    r"\bdenied\b",
                    r"\breject\w*\b",
                    r"\bno\b",
                    r"\bstop\b",
                    r"\bcancel\b",
                    r"\babort\b",
                    r"\bdon'?t\b",
                    r"\bdo not\b",
                    r"\bnever mind\b",
                    r"\bhay[ıi]r\b",
                    r"\biptal\b",
                    r"\breddet\w*\b",
                    r"\bvazge[çc]\w*\b",
                    r"\bdur\b",
                    r"\bolmaz\b",
                    r"\bonaylama\b",
                    r"\bistemiyorum\b",
                ]),
                negatives: Vec::new(),
            },
        ],
    })
}

/// Deterministically map one utterance to an approval decision. Same
/// input yields the same output; no randomness, no clock.
pub fn classify(input: &str, config: &ClassifierConfig) -> IntentResult {
    let text = input.to_lowercase();
    let lexicon = lexicon();

    let mut scored = Vec::with_capacity(lexicon.entries.len());
    for entry in &lexicon.entries {
        let positives = entry.positives.iter().filter(|p| p.is_match(&text)).count() as f64;
        let negatives = entry.negatives.iter().filter(|p| p.is_match(&text)).count() as f64;
        let raw = (entry.weight * positives - 2.0 * entry.weight * negatives).max(0.0);
        scored.push((entry.intent, raw, positives as usize));
    }

    let total: f64 = scored.iter().map(|(_, raw, _)| raw).sum();
    if total <= 0.0 {
        return IntentResult {
            intent: Intent::Ask,
            confidence: 0.0,
            reasoning: "no intent cues matched".to_string(),
            conflicting_intents: Vec::new(),
        };
    }

    let confidences: Vec<(Intent, f64, usize)> = scored
        .iter()
        .map(|(intent, raw, hits)| (*intent, raw / total, *hits))
        .collect();

    let (top_intent, _, _) = confidences
        .iter()
        .copied()
        .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
        .expect("non-empty confidence table");

    let conflicting: Vec<Intent> = confidences
        .iter()
        .filter(|(intent, confidence, _)| *intent != top_intent && *confidence > CONFLICT_FLOOR)
        .map(|(intent, _, _)| *intent)
        .collect();

    let in_play = |wanted: Intent| {
        top_intent == wanted || conflicting.contains(&wanted)
    };
    let has_score = |wanted: Intent| {
        confidences
            .iter()
            .any(|(intent, confidence, _)| *intent == wanted && *confidence > 0.0)
    };

    let chosen = match config.conflict_policy {
        ConflictPolicy::DenyOverApprove => {
            if in_play(Intent::Deny) && has_score(Intent::Deny) {
                Intent::Deny
            } else if in_play(Intent::Revise) && has_score(Intent::Revise) {
                Intent::Revise
            } else {
                top_intent
            }
        }
        ConflictPolicy::ApproveOverDeny => {
            if in_play(Intent::Approve) && has_score(Intent::Approve) {
                Intent::Approve
            } else if in_play(Intent::Revise) && has_score(Intent::Revise) {
                Intent::Revise
            } else {
                top_intent
            }
        }
        ConflictPolicy::Strict => {
            if conflicting.is_empty() {
                top_intent
            } else {
                Intent::Ask
            }
        }
    };

    let (confidence, hits) = confidences
        .iter()
        .find(|(intent, _, _)| *intent == chosen)
        .map(|(_, confidence, hits)| (*confidence, *hits))
        .unwrap_or((0.0, 0));

    let reasoning = if conflicting.is_empty() {
        format!("matched {hits} {} cue(s)", chosen.as_str())
    } else {
        format!(
            "matched {hits} {} cue(s); conflicts [{}] resolved by {:?} policy",
            chosen.as_str(),
            conflicting
                .iter()
                .map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            config.conflict_policy
        )
    };

    IntentResult {
        intent: chosen,
        confidence,
        reasoning,
        conflicting_intents: conflicting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_default(input: &str) -> IntentResult {
        classify(input, &ClassifierConfig::default())
    }

    #[test]
    fn plain_approve_is_high_confidence() {
        let result = classify_default("approve");
        assert_eq!(result.intent, Intent::Approve);
        assert!(result.confidence >= 0.85);
    }

    #[test]
    fn turkish_approval_scores_like_english() {
        let result = classify_default("onayla, basla");
        assert_eq!(result.intent, Intent::Approve);
        assert!(result.confidence >= 0.85);

        let result = classify_default("onaylıyorum, devam et");
        assert_eq!(result.intent, Intent::Approve);
    }

    #[test]
    fn negated_approval_flips_to_deny() {
        let result = classify_default("don't approve this yet");
        assert_eq!(result.intent, Intent::Deny);

        let result = classify_default("onaylama");
        assert_eq!(result.intent, Intent::Deny);
    }

    #[test]
    fn mixed_approve_and_revise_prefers_revise_under_default_policy() {
        let result = classify_default("approve, but revise milestone 2");
        assert_eq!(result.intent, Intent::Revise);
        assert!(result.confidence > 0.0);
        assert!(!result.conflicting_intents.is_empty());
    }

    #[test]
    fn approve_over_deny_policy_is_symmetric() {
        let config = ClassifierConfig {
            conflict_policy: ConflictPolicy::ApproveOverDeny,
            ..ClassifierConfig::default()
        };
        let result = classify("approve it, no wait", &config);
        assert_eq!(result.intent, Intent::Approve);
    }

    #[test]
    fn strict_policy_returns_ask_on_any_conflict() {
        let config = ClassifierConfig {
            conflict_policy: ConflictPolicy::Strict,
            ..ClassifierConfig::default()
        };
        let result = classify("approve, but revise milestone 2", &config);
        assert_eq!(result.intent, Intent::Ask);
    }

    #[test]
    fn unmatched_input_returns_ask_at_zero() {
        let result = classify_default("the weather is pleasant in ankara");
        assert_eq!(result.intent, Intent::Ask);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify_default("revise the second step");
        let b = classify_default("revise the second step");
        assert_eq!(a.intent, b.intent);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.reasoning, b.reasoning);
    }

    // Property: over a 600+ utterance non-approving corpus, the rate of
    // approve at or above the approve threshold stays at or below 0.5%.
    #[test]
    fn false_approve_rate_stays_below_half_a_percent() {
        let bases = [
            "please stop",
            "cancel this run",
            "reject the proposal",
            "don't approve this",
            "do not approve the plan",
            "hayir",
            "iptal et",
            "bunu reddet",
            "vazgec",
            "olmaz boyle",
            "why is this needed",
            "how does the pipeline work",
            "what happens next",
            "explain the second milestone",
            "clarify the rollback steps",
            "neden boyle",
            "nasil calisiyor",
            "bu ne demek",
            "acikla lutfen",
            "soru soracagim",
            "revise the plan",
            "change milestone two",
            "update the estimates",
            "rework the qa section",
            "bunu degistir",
            "stop everything",
            "never mind",
            "abort the deployment",
            "dur bakalim",
            "istemiyorum",
        ];
        let suffixes = [
            "",
            " now",
            " please",
            " first",
            " today",
            " again",
            " for milestone 2",
            " before qa",
            " in the morning",
            " right away",
            " immediately",
            " if possible",
            " hemen",
            " lutfen",
            " simdi",
            " once more",
            " carefully",
            " quickly",
            " later",
            " tomorrow",
            " asap",
        ];

        let config = ClassifierConfig::default();
        let mut total = 0usize;
        let mut false_approves = 0usize;
        for base in bases {
            for suffix in suffixes {
                total += 1;
                let utterance = format!("{base}{suffix}");
                let result = classify(&utterance, &config);
                if result.intent == Intent::Approve
                    && result.confidence >= config.approve_threshold
                {
                    false_approves += 1;
                }
            }
        }
        assert!(total >= 600);
        assert!(
            (false_approves as f64) <= (total as f64) * 0.005,
            "{false_approves} false approves over {total} utterances"
        );
    }
}
