use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(test)] use mockall::automock;
use crate::frame::PORT_LIMIT;

/// Source of starting points for the ephemeral port search in `connect`. The search probes
///  linearly from the candidate, so the allocator only decides where to start.
#[cfg_attr(test, automock)]
pub trait PortAllocator: Send + 'static {
    /// a port below [PORT_LIMIT]
    fn candidate(&mut self) -> u8;
}

pub struct RandomPortAllocator {
    rng: StdRng,
}

impl RandomPortAllocator {
    pub fn new(seed: Option<u64>) -> RandomPortAllocator {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        RandomPortAllocator { rng }
    }
}

impl PortAllocator for RandomPortAllocator {
    fn candidate(&mut self) -> u8 {
        self.rng.gen_range(0..PORT_LIMIT)
    }
}

/// The ports to try for a new session, in probing order: the candidate, then upward, wrapping
///  around the port space
pub fn probe_order(candidate: u8) -> impl Iterator<Item = u8> {
    (0..PORT_LIMIT).map(move |offset| ((candidate as u16 + offset as u16) % PORT_LIMIT as u16) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_seeded_is_reproducible() {
        let mut a = RandomPortAllocator::new(Some(42));
        let mut b = RandomPortAllocator::new(Some(42));

        for _ in 0..100 {
            let port = a.candidate();
            assert!(port < PORT_LIMIT);
            assert_eq!(port, b.candidate());
        }
    }

    #[rstest]
    #[case::start(0, vec![0, 1, 2])]
    #[case::middle(50, vec![50, 51, 52])]
    #[case::wrap(126, vec![126, 127, 0])]
    fn test_probe_order(#[case] candidate: u8, #[case] expected_prefix: Vec<u8>) {
        let order = probe_order(candidate).collect::<Vec<_>>();
        assert_eq!(order.len(), PORT_LIMIT as usize);
        assert_eq!(&order[..3], expected_prefix.as_slice());

        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, (0..PORT_LIMIT).collect::<Vec<_>>());
    }
}
