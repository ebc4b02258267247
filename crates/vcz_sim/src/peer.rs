use std::fmt;

use rand::Rng;

/// Prefix of the ids generated by the simulator, in Azureus style.
const CLIENT_PREFIX: &[u8; 8] = b"-VS0003-";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        rng.fill(&mut id[8..]);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn display_is_hex() {
        let id = PeerId::from([0xAB; 20]);
        assert_eq!(id.to_string(), "ab".repeat(20));
        assert_eq!(format!("{id:?}"), id.to_string());
    }

    #[test]
    fn generated_ids_have_the_prefix() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = PeerId::generate(&mut rng);
        let b = PeerId::generate(&mut rng);

        let raw: [u8; 20] = a.into();
        assert_eq!(&raw[..8], CLIENT_PREFIX);
        assert!(a.to_string().starts_with(&hex::encode(CLIENT_PREFIX)));
        assert_ne!(a, b);
    }
}
