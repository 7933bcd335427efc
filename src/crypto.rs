//
// Random values
//

pub fn get_random_bytes<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut array = [0u8; N];
    SystemRandom::new().fill(&mut array).expect("Error generating random values");

    array
}

/// Encodes random bytes using the provided function.
pub fn encode_random_bytes<const N: usize>(e: data_encoding::Encoding) -> String {
    e.encode(&get_random_bytes::<N>())
}
