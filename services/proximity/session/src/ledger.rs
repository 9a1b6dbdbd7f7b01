//! Social-link request ledger.
//!
//! Per (requester, target) pair: `None -> Requested -> Approved | Rejected`.
//! Pending requests live in the target's `pending_link_requests`, rejected
//! ones in its `rejected_link_requests`; approved links accumulate in the
//! requester's `approved_links`. Every transition is idempotent and acting
//! on an absent request does nothing. A new request reopens a rejected pair.

use crate::directory::ProfileDirectory;
use proximity_storage::{PeerIdentity, SocialLink};
use tracing::{debug, info};

/// State of one request pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRequestState {
    /// No request recorded
    None,
    /// Waiting for the target's decision
    Requested,
    /// The requester holds every link the target shares
    Approved,
    /// The target turned the last request down
    Rejected,
}

/// Record that `requester` asked `target` for its links. Returns true if the
/// request is new.
pub fn request(directory: &mut ProfileDirectory, requester: &PeerIdentity, target: &PeerIdentity) -> bool {
    directory.resolve_or_create(requester);
    directory.resolve_or_create(target);

    let mut inserted = false;
    directory.update(target, |record| {
        let reopened = record.rejected_link_requests.remove(requester);
        inserted = record.pending_link_requests.insert(requester.clone());
        inserted || reopened
    });
    if inserted {
        info!("Social link request {} -> {}", requester, target);
    }
    inserted
}

/// Approve a pending request: the target's links are added to the
/// requester's approved links. Returns false if nothing was pending.
pub fn approve(directory: &mut ProfileDirectory, requester: &PeerIdentity, target: &PeerIdentity) -> bool {
    let removed = directory.update(target, |record| {
        record.pending_link_requests.remove(requester)
    });
    if !removed {
        debug!("No pending link request {} -> {} to approve", requester, target);
        return false;
    }

    let links: Vec<SocialLink> = directory
        .get(target)
        .map(|r| r.social_links.clone())
        .unwrap_or_default();
    grant(directory, requester, links);
    info!("Social link request {} -> {} approved", requester, target);
    true
}

/// Reject a pending request. Returns false if nothing was pending.
pub fn reject(directory: &mut ProfileDirectory, requester: &PeerIdentity, target: &PeerIdentity) -> bool {
    let removed = directory.update(target, |record| {
        let removed = record.pending_link_requests.remove(requester);
        if removed {
            record.rejected_link_requests.insert(requester.clone());
        }
        removed
    });
    if removed {
        info!("Social link request {} -> {} rejected", requester, target);
    }
    removed
}

/// Current state of the (requester, target) pair
pub fn state(directory: &ProfileDirectory, requester: &PeerIdentity, target: &PeerIdentity) -> LinkRequestState {
    let pending = directory
        .get(target)
        .map(|r| r.pending_link_requests.contains(requester))
        .unwrap_or(false);
    if pending {
        return LinkRequestState::Requested;
    }
    let rejected = directory
        .get(target)
        .map(|r| r.rejected_link_requests.contains(requester))
        .unwrap_or(false);
    if rejected {
        return LinkRequestState::Rejected;
    }

    let approved = match (directory.get(requester), directory.get(target)) {
        (Some(req), Some(tgt)) => {
            !tgt.social_links.is_empty()
                && tgt.social_links.iter().all(|l| req.approved_links.contains(l))
        }
        _ => false,
    };
    if approved {
        LinkRequestState::Approved
    } else {
        LinkRequestState::None
    }
}

/// Add `links` to `requester`'s approved links
fn grant(directory: &mut ProfileDirectory, requester: &PeerIdentity, links: Vec<SocialLink>) -> bool {
    directory.resolve_or_create(requester);
    directory.update(requester, |record| {
        let before = record.approved_links.len();
        record.approved_links.extend(links);
        record.approved_links.len() != before
    })
}

/// A remote target approved the local user's request and sent its links
pub fn apply_grant(
    directory: &mut ProfileDirectory,
    local: &PeerIdentity,
    from: &PeerIdentity,
    links: Vec<SocialLink>,
) {
    directory.update(from, |record| record.pending_link_requests.remove(local));
    if grant(directory, local, links) {
        info!("Received social links from {}", from);
    }
}

/// A remote target rejected the local user's request
pub fn apply_decline(directory: &mut ProfileDirectory, local: &PeerIdentity, from: &PeerIdentity) {
    let declined = directory.update(from, |record| {
        let removed = record.pending_link_requests.remove(local);
        let recorded = record.rejected_link_requests.insert(local.clone());
        removed || recorded
    });
    if declined {
        info!("Social link request to {} was declined", from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ProfileDraft;
    use proximity_storage::MemoryProfileStore;
    use std::sync::Arc;

    fn id(name: &str) -> PeerIdentity {
        PeerIdentity::from(name)
    }

    async fn directory_with_target() -> ProfileDirectory {
        let (mut dir, _outcomes) = ProfileDirectory::new(Arc::new(MemoryProfileStore::new()));
        dir.upsert_local(
            &id("Target"),
            ProfileDraft {
                username: "target".into(),
                social_links: vec![
                    SocialLink::new("web", "https://t.example"),
                    SocialLink::new("mastodon", "https://m.example/@t"),
                ],
                ..Default::default()
            },
        );
        dir
    }

    #[tokio::test]
    async fn test_request_twice_single_pending() {
        let mut dir = directory_with_target().await;

        assert!(request(&mut dir, &id("Req"), &id("Target")));
        assert!(!request(&mut dir, &id("Req"), &id("Target")));

        let pending = &dir.get(&id("Target")).unwrap().pending_link_requests;
        assert_eq!(pending.len(), 1);
        assert_eq!(state(&dir, &id("Req"), &id("Target")), LinkRequestState::Requested);
    }

    #[tokio::test]
    async fn test_approve_copies_links() {
        let mut dir = directory_with_target().await;
        request(&mut dir, &id("Req"), &id("Target"));

        assert!(approve(&mut dir, &id("Req"), &id("Target")));
        assert!(dir.get(&id("Target")).unwrap().pending_link_requests.is_empty());

        let target_links = dir.get(&id("Target")).unwrap().social_links.clone();
        let approved = &dir.get(&id("Req")).unwrap().approved_links;
        assert!(target_links.iter().all(|l| approved.contains(l)));
        assert_eq!(state(&dir, &id("Req"), &id("Target")), LinkRequestState::Approved);

        // Approving again is a no-op
        assert!(!approve(&mut dir, &id("Req"), &id("Target")));
    }

    #[tokio::test]
    async fn test_reject_and_absent_requests() {
        let mut dir = directory_with_target().await;

        assert!(!reject(&mut dir, &id("Req"), &id("Target")));
        assert!(!approve(&mut dir, &id("Nobody"), &id("Target")));

        request(&mut dir, &id("Req"), &id("Target"));
        assert!(reject(&mut dir, &id("Req"), &id("Target")));
        assert_eq!(state(&dir, &id("Req"), &id("Target")), LinkRequestState::Rejected);
        assert!(dir
            .get(&id("Req"))
            .map(|r| r.approved_links.is_empty())
            .unwrap_or(true));

        // Rejecting again changes nothing
        assert!(!reject(&mut dir, &id("Req"), &id("Target")));
        assert_eq!(state(&dir, &id("Req"), &id("Target")), LinkRequestState::Rejected);
    }

    #[tokio::test]
    async fn test_new_request_reopens_rejected_pair() {
        let mut dir = directory_with_target().await;
        request(&mut dir, &id("Req"), &id("Target"));
        reject(&mut dir, &id("Req"), &id("Target"));

        assert!(request(&mut dir, &id("Req"), &id("Target")));
        assert_eq!(state(&dir, &id("Req"), &id("Target")), LinkRequestState::Requested);
        assert!(dir.get(&id("Target")).unwrap().rejected_link_requests.is_empty());

        assert!(approve(&mut dir, &id("Req"), &id("Target")));
        assert_eq!(state(&dir, &id("Req"), &id("Target")), LinkRequestState::Approved);
    }

    #[tokio::test]
    async fn test_remote_grant_and_decline() {
        let (mut dir, _outcomes) = ProfileDirectory::new(Arc::new(MemoryProfileStore::new()));
        let me = id("Me");
        let bob = id("Bob");

        request(&mut dir, &me, &bob);
        apply_grant(&mut dir, &me, &bob, vec![SocialLink::new("web", "https://bob.example")]);
        assert!(dir.get(&bob).unwrap().pending_link_requests.is_empty());
        assert_eq!(dir.get(&me).unwrap().approved_links.len(), 1);

        request(&mut dir, &me, &bob);
        apply_decline(&mut dir, &me, &bob);
        assert!(dir.get(&bob).unwrap().pending_link_requests.is_empty());
        assert_eq!(state(&dir, &me, &bob), LinkRequestState::Rejected);
    }
}
