use serde_json::json;
use sha2::{Digest, Sha256};

use cadence_types::{Actor, Diff, DiffStatus, EventType, Hunk, HunkStatus};

use crate::event_bus::{EmitOptions, EventBus};

const PARTIAL_REJECT_REASON: &str = "Not selected during partial approval";

/// Selection grammar: empty or `all` covers every pending hunk; otherwise
/// a comma/whitespace-separated list of 1-based indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkSelection {
    All,
    Indices(Vec<usize>),
}

pub fn parse_selection(raw: &str) -> anyhow::Result<HunkSelection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return Ok(HunkSelection::All);
    }
    let mut indices = Vec::new();
    for token in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        let index: usize = token
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid hunk index `{token}`"))?;
        if index == 0 {
            anyhow::bail!("hunk indices are 1-based");
        }
        indices.push(index);
    }
    if indices.is_empty() {
        anyhow::bail!("empty hunk selection");
    }
    Ok(HunkSelection::Indices(indices))
}

#[derive(Debug, Clone)]
pub struct ApproveSummary {
    pub diff_id: String,
    pub approved: usize,
    pub rejected: usize,
    pub checksum: String,
    pub status: DiffStatus,
}

#[derive(Debug, Clone)]
pub struct RejectSummary {
    pub diff_id: String,
    pub rejected: usize,
    pub status: DiffStatus,
    pub terminal: bool,
}

fn selected(selection: &HunkSelection, index: usize) -> bool {
    match selection {
        HunkSelection::All => true,
        HunkSelection::Indices(indices) => indices.contains(&(index + 1)),
    }
}

fn validate_indices(diff: &Diff, selection: &HunkSelection) -> anyhow::Result<()> {
    if let HunkSelection::Indices(indices) = selection {
        for index in indices {
            if *index > diff.hunks.len() {
                anyhow::bail!(
                    "hunk index {index} out of range (diff has {} hunks)",
                    diff.hunks.len()
                );
            }
        }
    }
    Ok(())
}

/// SHA-256 over the concatenated approved hunk contents, in hunk order.
pub fn approved_content_checksum(hunks: &[Hunk]) -> String {
    let mut hasher = Sha256::new();
    for hunk in hunks {
        if hunk.status == HunkStatus::Approved {
            hasher.update(hunk.content.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Approve the selected pending hunks. An explicit index list rejects
/// every other pending hunk; the diff is then applied and its checksum
/// recorded.
pub fn approve_hunks(
    diff: &mut Diff,
    selection: &HunkSelection,
    bus: &EventBus,
    actor: Actor,
) -> anyhow::Result<ApproveSummary> {
    validate_indices(diff, selection)?;
    let covers_pending = diff
        .hunks
        .iter()
        .enumerate()
        .any(|(index, hunk)| hunk.status == HunkStatus::Pending && selected(selection, index));
    if !covers_pending {
        anyhow::bail!("selection matched no pending hunks");
    }

    let mut approved = 0usize;
    let mut rejected = 0usize;
    for index in 0..diff.hunks.len() {
        if diff.hunks[index].status != HunkStatus::Pending {
            continue;
        }
        if selected(selection, index) {
            diff.hunks[index].status = HunkStatus::Approved;
            approved += 1;
            emit(
                bus,
                EventType::DiffHunkApproved,
                json!({
                    "diffId": diff.id,
                    "hunkId": diff.hunks[index].hunk_id,
                    "index": index + 1,
                }),
                actor,
            );
        } else if matches!(selection, HunkSelection::Indices(_)) {
            diff.hunks[index].status = HunkStatus::Rejected;
            rejected += 1;
            emit(
                bus,
                EventType::DiffHunkRejected,
                json!({
                    "diffId": diff.id,
                    "hunkId": diff.hunks[index].hunk_id,
                    "index": index + 1,
                    "reason": PARTIAL_REJECT_REASON,
                }),
                actor,
            );
        }
    }

    emit(
        bus,
        EventType::DiffApproved,
        json!({"diffId": diff.id}),
        actor,
    );

    let checksum = approved_content_checksum(&diff.hunks);
    emit(
        bus,
        EventType::DiffApplied,
        json!({
            "diffId": diff.id,
            "filePath": diff.file_path,
            "checksum": checksum,
        }),
        actor,
    );
    diff.status = DiffStatus::Applied;

    Ok(ApproveSummary {
        diff_id: diff.id.clone(),
        approved,
        rejected,
        checksum,
        status: diff.status,
    })
}

/// Reject the selected pending hunks. The diff goes terminal-rejected
/// when the selection was `all` or no pending hunks remain.
pub fn reject_hunks(
    diff: &mut Diff,
    selection: &HunkSelection,
    bus: &EventBus,
    actor: Actor,
) -> anyhow::Result<RejectSummary> {
    validate_indices(diff, selection)?;

    let mut rejected = 0usize;
    for index in 0..diff.hunks.len() {
        if diff.hunks[index].status != HunkStatus::Pending {
            continue;
        }
        if selected(selection, index) {
            diff.hunks[index].status = HunkStatus::Rejected;
            rejected += 1;
            emit(
                bus,
                EventType::DiffHunkRejected,
                json!({
                    "diffId": diff.id,
                    "hunkId": diff.hunks[index].hunk_id,
                    "index": index + 1,
                }),
                actor,
            );
        }
    }

    let terminal = matches!(selection, HunkSelection::All) || !diff.has_pending_hunks();
    if terminal {
        emit(
            bus,
            EventType::DiffRejected,
            json!({"diffId": diff.id}),
            actor,
        );
    }
    diff.status = diff.derived_status();

    Ok(RejectSummary {
        diff_id: diff.id.clone(),
        rejected,
        status: diff.status,
        terminal,
    })
}

fn emit(bus: &EventBus, event_type: EventType, payload: serde_json::Value, actor: Actor) {
    if let Err(err) = bus.emit(event_type, payload, EmitOptions::actor(actor)) {
        tracing::warn!(error = %err, event = %event_type, "diff review emit failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::WorkflowState;

    fn two_hunk_diff() -> Diff {
        Diff::new(
            "src/main.rs",
            vec![
                Hunk::new(1, 1, 1, 2, "+fn a() {}\n"),
                Hunk::new(9, 2, 10, 2, "+fn b() {}\n"),
            ],
        )
    }

    fn bus() -> EventBus {
        EventBus::new("run-1", WorkflowState::Implementing)
    }

    #[test]
    fn selection_grammar_parses_all_and_index_lists() {
        assert_eq!(parse_selection("").unwrap(), HunkSelection::All);
        assert_eq!(parse_selection("all").unwrap(), HunkSelection::All);
        assert_eq!(
            parse_selection("1, 3 4").unwrap(),
            HunkSelection::Indices(vec![1, 3, 4])
        );
        assert!(parse_selection("0").is_err());
        assert!(parse_selection("two").is_err());
    }

    #[test]
    fn partial_approval_rejects_unselected_pending_hunks() {
        let bus = bus();
        let mut diff = two_hunk_diff();
        let summary =
            approve_hunks(&mut diff, &HunkSelection::Indices(vec![1]), &bus, Actor::User).unwrap();

        assert_eq!(summary.approved, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(diff.hunks[0].status, HunkStatus::Approved);
        assert_eq!(diff.hunks[1].status, HunkStatus::Rejected);
        assert_eq!(diff.status, DiffStatus::Applied);

        assert_eq!(bus.events_of_type(EventType::DiffHunkApproved).len(), 1);
        let rejections = bus.events_of_type(EventType::DiffHunkRejected);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].payload["reason"], PARTIAL_REJECT_REASON);
        assert_eq!(bus.events_of_type(EventType::DiffApproved).len(), 1);
        assert_eq!(bus.events_of_type(EventType::DiffApplied).len(), 1);
    }

    #[test]
    fn approve_all_keeps_every_hunk() {
        let bus = bus();
        let mut diff = two_hunk_diff();
        let summary = approve_hunks(&mut diff, &HunkSelection::All, &bus, Actor::User).unwrap();
        assert_eq!(summary.approved, 2);
        assert_eq!(summary.rejected, 0);
        assert_eq!(summary.checksum, approved_content_checksum(&diff.hunks));
    }

    #[test]
    fn checksum_covers_only_approved_content_in_order() {
        let mut hunks = vec![
            Hunk::new(1, 1, 1, 1, "alpha"),
            Hunk::new(2, 1, 2, 1, "beta"),
        ];
        hunks[0].status = HunkStatus::Approved;
        hunks[1].status = HunkStatus::Rejected;
        let checksum = approved_content_checksum(&hunks);

        let mut hasher = Sha256::new();
        hasher.update(b"alpha");
        assert_eq!(checksum, format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn reject_all_goes_terminal() {
        let bus = bus();
        let mut diff = two_hunk_diff();
        let summary = reject_hunks(&mut diff, &HunkSelection::All, &bus, Actor::User).unwrap();
        assert!(summary.terminal);
        assert_eq!(diff.status, DiffStatus::Rejected);
        assert_eq!(bus.events_of_type(EventType::DiffRejected).len(), 1);
    }

    #[test]
    fn partial_reject_keeps_the_diff_pending() {
        let bus = bus();
        let mut diff = two_hunk_diff();
        let summary =
            reject_hunks(&mut diff, &HunkSelection::Indices(vec![1]), &bus, Actor::User).unwrap();
        assert!(!summary.terminal);
        assert_eq!(diff.status, DiffStatus::Pending);
        assert!(bus.events_of_type(EventType::DiffRejected).is_empty());
    }

    #[test]
    fn out_of_range_selection_is_refused_without_mutation() {
        let bus = bus();
        let mut diff = two_hunk_diff();
        assert!(approve_hunks(&mut diff, &HunkSelection::Indices(vec![5]), &bus, Actor::User).is_err());
        assert!(diff.hunks.iter().all(|h| h.status == HunkStatus::Pending));
        assert!(bus.log().is_empty());
    }
}
