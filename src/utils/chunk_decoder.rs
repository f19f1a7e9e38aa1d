/// Decodes raw process output into text exactly once, at the stream boundary.
///
/// A multi-byte UTF-8 character split across two reads is carried over to the
/// next call instead of turning into replacement characters. Invalid bytes
/// still decode lossily.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        None => {
                            // Truncated sequence at the end; wait for the rest.
                            self.pending.drain(..valid_up_to);
                            return decoded;
                        }
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid_len);
                        }
                    }
                }
            }
        }
    }

    /// Drains whatever is still held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
