//! Discovery filter: which connected peers may stay connected.
//!
//! Pure functions over profiles; the manager decides when to run them and
//! performs the evictions. Missing positions never cause an eviction.

use crate::config::DiscoveryFilterConfig;
use proximity_storage::{Coordinates, PeerIdentity, ProfileRecord};
use std::collections::BTreeSet;

/// Clamp a requested maximum distance. Returns the effective value and
/// whether the request had to be adjusted.
pub fn clamp_distance(requested: f64) -> (f64, bool) {
    if requested.is_nan() || requested < 0.0 {
        (0.0, true)
    } else {
        (requested, false)
    }
}

/// Peers farther than `max_distance_m` from `local`
pub fn distance_violations<'a>(
    local: Option<Coordinates>,
    max_distance_m: f64,
    peers: impl IntoIterator<Item = &'a ProfileRecord>,
) -> Vec<PeerIdentity> {
    let Some(local) = local.filter(|c| !c.is_zero()) else {
        return Vec::new();
    };

    peers
        .into_iter()
        .filter(|p| p.has_location())
        .filter_map(|p| {
            let coords = p.coordinates?;
            (local.distance_to(&coords) > max_distance_m).then(|| p.id.clone())
        })
        .collect()
}

/// Peers without the premium flag, when subscription-only is on
pub fn subscription_violations<'a>(
    subscription_only: bool,
    peers: impl IntoIterator<Item = &'a ProfileRecord>,
) -> Vec<PeerIdentity> {
    if !subscription_only {
        return Vec::new();
    }
    peers
        .into_iter()
        .filter(|p| !p.is_premium)
        .map(|p| p.id.clone())
        .collect()
}

/// Every peer either filter rejects, sorted and de-duplicated
pub fn evaluate(
    config: &DiscoveryFilterConfig,
    local: Option<Coordinates>,
    peers: &[&ProfileRecord],
) -> Vec<PeerIdentity> {
    let mut evicted: BTreeSet<PeerIdentity> = BTreeSet::new();
    evicted.extend(distance_violations(
        local,
        config.max_distance_m,
        peers.iter().copied(),
    ));
    evicted.extend(subscription_violations(
        config.subscription_only,
        peers.iter().copied(),
    ));
    evicted.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, coords: Option<(f64, f64)>, premium: bool) -> ProfileRecord {
        let mut record = ProfileRecord::placeholder(name.into());
        record.coordinates = coords.map(|(lat, lon)| Coordinates::new(lat, lon));
        record.is_premium = premium;
        record
    }

    #[test]
    fn test_clamp_distance() {
        assert_eq!(clamp_distance(-5.0), (0.0, true));
        assert_eq!(clamp_distance(f64::NAN), (0.0, true));
        assert_eq!(clamp_distance(250.0), (250.0, false));
        assert_eq!(clamp_distance(0.0), (0.0, false));
    }

    #[test]
    fn test_distance_fail_open() {
        let near = peer("Near", Some((52.5200, 13.4050)), false);
        let far = peer("Far", Some((52.5300, 13.4050)), false);
        let unknown = peer("Unknown", None, false);
        let zero = peer("Zero", Some((0.0, 0.0)), false);
        let peers = [&near, &far, &unknown, &zero];

        let local = Some(Coordinates::new(52.5200, 13.4051));
        assert_eq!(
            distance_violations(local, 100.0, peers.iter().copied()),
            vec![PeerIdentity::from("Far")]
        );

        // No local fix: nobody is evicted
        assert!(distance_violations(None, 100.0, peers.iter().copied()).is_empty());
        assert!(distance_violations(Some(Coordinates::new(0.0, 0.0)), 1.0, peers.iter().copied())
            .is_empty());
    }

    #[test]
    fn test_subscription_filter() {
        let free = peer("Free", None, false);
        let paid = peer("Paid", None, true);
        let peers = [&free, &paid];

        assert!(subscription_violations(false, peers.iter().copied()).is_empty());
        assert_eq!(
            subscription_violations(true, peers.iter().copied()),
            vec![PeerIdentity::from("Free")]
        );
    }

    #[test]
    fn test_evaluate_is_idempotent_and_commutative() {
        let far_free = peer("A", Some((10.0, 10.0)), false);
        let near_paid = peer("B", Some((52.52, 13.405)), true);
        let config = DiscoveryFilterConfig {
            max_distance_m: 100.0,
            subscription_only: true,
        };
        let local = Some(Coordinates::new(52.52, 13.405));

        let forward = evaluate(&config, local, &[&far_free, &near_paid]);
        let reverse = evaluate(&config, local, &[&near_paid, &far_free]);
        assert_eq!(forward, vec![PeerIdentity::from("A")]);
        assert_eq!(forward, reverse);
    }
}
