//! Diagnostic trouble code rendering.

/// Renders a two-byte trouble code as the familiar SAE J2012 string,
/// "P0143" style. The top two bits of the first byte select the code
/// area (powertrain, chassis, body, network), the remaining 14 bits are
/// printed as hex digits.
pub fn decode_j2012(hi: u8, lo: u8) -> String {
    let area = match hi >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!("{area}{:02X}{lo:02X}", hi & 0x3F)
}
