//! Client selection strategies for [`super::manager::RoundManager::select_clients`].
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{registry::Client, round::SelectionStrategy};

/// Selects up to `max_clients` ids from `candidates` per `strategy`. Ties
/// (and the `random` strategy itself) are broken deterministically:
/// candidates are canonicalized into lexicographic id order first, so the
/// same input set and seed always yields the same selection.
pub fn select_clients(
    mut candidates: Vec<Client>,
    strategy: SelectionStrategy,
    max_clients: usize,
    seed: u64,
) -> Vec<String> {
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    match strategy {
        SelectionStrategy::Random => {
            let mut rng = StdRng::seed_from_u64(seed);
            candidates.shuffle(&mut rng);
        }
        SelectionStrategy::ResourceWeighted => candidates.sort_by(|a, b| {
            resource_score(b)
                .partial_cmp(&resource_score(a))
                .expect("resource score is never NaN")
                .then_with(|| a.id.cmp(&b.id))
        }),
        SelectionStrategy::LeastParticipation => candidates.sort_by(|a, b| {
            a.rounds_participated
                .cmp(&b.rounds_participated)
                .then_with(|| a.id.cmp(&b.id))
        }),
    }

    candidates
        .into_iter()
        .take(max_clients)
        .map(|c| c.id)
        .collect()
}

/// `1.0 × (2.0 if hasAccelerator else 1.0) × (1 + 0.5 × max(0, acceleratorCount-1))`.
fn resource_score(client: &Client) -> f64 {
    let profile = &client.device_profile;
    let accelerator_count = if profile.has_accelerator {
        profile.accelerator_count
    } else {
        0
    };
    let accel_factor = if profile.has_accelerator { 2.0 } else { 1.0 };
    let extra = (accelerator_count as f64 - 1.0).max(0.0);
    accel_factor * (1.0 + 0.5 * extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientStatus, DeviceProfile};
    use std::time::SystemTime;

    fn client(id: &str, has_accelerator: bool, accelerator_count: u32, rounds: u64) -> Client {
        Client {
            id: id.to_string(),
            model_kind: "m1".to_string(),
            device_profile: DeviceProfile {
                has_accelerator,
                accelerator_count,
                os_tag: "linux".to_string(),
            },
            registered_at: SystemTime::now(),
            last_seen_at: SystemTime::now(),
            rounds_participated: rounds,
            status: ClientStatus::Active,
        }
    }

    #[test]
    fn random_selection_is_deterministic_given_same_seed() {
        let candidates = vec![
            client("c1", false, 0, 0),
            client("c2", false, 0, 0),
            client("c3", false, 0, 0),
            client("c4", false, 0, 0),
            client("c5", false, 0, 0),
        ];
        let first = select_clients(candidates.clone(), SelectionStrategy::Random, 3, 42);
        let second = select_clients(candidates, SelectionStrategy::Random, 3, 42);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn resource_weighted_prefers_accelerated_clients() {
        let candidates = vec![
            client("plain", false, 0, 0),
            client("accelerated", true, 3, 0),
        ];
        let selected = select_clients(candidates, SelectionStrategy::ResourceWeighted, 1, 0);
        assert_eq!(selected, vec!["accelerated".to_string()]);
    }

    #[test]
    fn resource_weighted_ties_break_lexicographically() {
        let candidates = vec![client("b", false, 0, 0), client("a", false, 0, 0)];
        let selected = select_clients(candidates, SelectionStrategy::ResourceWeighted, 2, 0);
        assert_eq!(selected, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn least_participation_sorts_ascending() {
        let candidates = vec![client("veteran", false, 0, 5), client("rookie", false, 0, 0)];
        let selected = select_clients(candidates, SelectionStrategy::LeastParticipation, 2, 0);
        assert_eq!(selected, vec!["rookie".to_string(), "veteran".to_string()]);
    }
}
