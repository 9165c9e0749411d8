//! Small xorshift generator for TCP initial sequence numbers, DHCP
//! transaction ids and IP idents. Not cryptographic; the host seeds it
//! with whatever entropy it has (clock, ADC noise, serial number).

#[derive(Debug)]
pub(crate) struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        // A zero state would be stuck at zero forever.
        XorShift32 {
            state: if seed == 0 { 0x9E3779B9 } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}
