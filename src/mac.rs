use rand::Rng;

/// Generates a random unicast MAC address, e.g. `5A:0F:13:C2:77:E1`.
///
/// The first octet is drawn from `[0x00, 0xFE]` with its lowest bit cleared,
/// so the address is never multicast or broadcast. The other five octets
/// are unconstrained.
pub fn generate_mac<R: Rng + ?Sized>(rng: &mut R) -> String {
    let first = rng.random_range(0x00..=0xFE_u8) & 0xFE;
    let mut octets = [first, 0, 0, 0, 0, 0];
    for octet in octets.iter_mut().skip(1) {
        *octet = rng.random();
    }

    octets
        .iter()
        .map(|octet| format!("{octet:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Generates a MAC address from the thread-local random source.
pub fn random_mac() -> String {
    generate_mac(&mut rand::rng())
}
