//! Synthetic user generation.
//!
//! Each tick evaluates the flag for a freshly generated synthetic user so
//! that the platform sees a realistic spread of unique contexts. All draws
//! go through the injected RNG, so a seeded run produces the same users.

use rand::Rng;
use serde_json::{json, Value};

const FIRST_NAMES: &[&str] = &[
    "Ada", "Grace", "Alan", "Edsger", "Barbara", "Donald", "Radia", "Ken",
    "Margaret", "Dennis", "Frances", "Tony",
];

const LAST_NAMES: &[&str] = &[
    "Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Knuth", "Perlman",
    "Thompson", "Hamilton", "Ritchie", "Allen", "Hoare",
];

const PLANS: &[&str] = &["platinum", "silver", "gold", "diamond", "free"];

const ROLES: &[&str] = &["reader", "writer", "admin"];

const METROS: &[&str] = &[
    "New York", "Chicago", "Minneapolis", "Atlanta", "Los Angeles",
    "San Francisco", "Denver", "Boston",
];

/// A synthetic user context evaluated against the flag.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticUser {
    /// Unique user key, `usr-<uuid>`
    pub key: String,
    pub name: String,
    pub plan: &'static str,
    pub role: &'static str,
    pub metro: &'static str,
    pub beta: bool,
}

impl SyntheticUser {
    /// Generates a user from the given random source.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        let key = format!("usr-{}", uuid::Builder::from_random_bytes(bytes).into_uuid());

        let name = format!(
            "{} {}",
            FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())],
            LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())],
        );

        Self {
            key,
            name,
            plan: PLANS[rng.gen_range(0..PLANS.len())],
            role: ROLES[rng.gen_range(0..ROLES.len())],
            metro: METROS[rng.gen_range(0..METROS.len())],
            beta: rng.gen_ratio(3, 10),
        }
    }

    /// JSON context payload sent with evaluation requests.
    pub fn context_json(&self) -> Value {
        json!({
            "kind": "user",
            "key": self.key,
            "name": self.name,
            "plan": self.plan,
            "role": self.role,
            "metro": self.metro,
            "beta": self.beta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_generation_is_deterministic_for_a_seed() {
        let mut rng1 = ChaCha8Rng::seed_from_u64(99);
        let mut rng2 = ChaCha8Rng::seed_from_u64(99);
        assert_eq!(
            SyntheticUser::generate(&mut rng1),
            SyntheticUser::generate(&mut rng2)
        );
    }

    #[test]
    fn test_keys_are_unique_across_draws() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let a = SyntheticUser::generate(&mut rng);
        let b = SyntheticUser::generate(&mut rng);
        assert_ne!(a.key, b.key);
        assert!(a.key.starts_with("usr-"));
    }

    #[test]
    fn test_context_payload_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let user = SyntheticUser::generate(&mut rng);
        let ctx = user.context_json();
        assert_eq!(ctx["kind"], "user");
        assert_eq!(ctx["key"], user.key.as_str());
        assert!(ctx["plan"].is_string());
    }
}
