// ── Beacon-format advertisement check ──
//
// Used by the scan post-filter when the cloud asks for a beacon scan.
// Recognizes the two common frame families: iBeacon proximity frames
// (Apple manufacturer data, subtype 0x02 length 0x15) and Eddystone
// service data (UUID 0xFEAA).

/// Walk the advertisement's AD structures and report whether any of
/// them is a recognized beacon frame. Malformed structures end the walk
/// without matching.
pub fn is_beacon(advertisement: &[u8]) -> bool {
    let mut rest = advertisement;
    while let [len, tail @ ..] = rest {
        let len = usize::from(*len);
        if len == 0 || len > tail.len() {
            return false;
        }
        let (unit, remainder) = tail.split_at(len);
        if let [ad_type, payload @ ..] = unit {
            match ad_type {
                // Manufacturer specific data: Apple (0x004C), iBeacon
                // proximity subtype.
                0xFF if payload.len() >= 4
                    && payload[0] == 0x4C
                    && payload[1] == 0x00
                    && payload[2] == 0x02
                    && payload[3] == 0x15 =>
                {
                    return true;
                }
                // Service data for the Eddystone UUID 0xFEAA.
                0x16 if payload.len() >= 2 && payload[0] == 0xAA && payload[1] == 0xFE => {
                    return true;
                }
                _ => {}
            }
        }
        rest = remainder;
    }
    false
}
