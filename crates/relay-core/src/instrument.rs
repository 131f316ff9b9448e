//! Instrument identifiers.
//!
//! Instruments are opaque to the relay. Validation only keeps identifiers that
//! would corrupt the upstream handshake or log lines out of the system.

/// Maximum instrument identifier length.
pub const MAX_INSTRUMENT_LENGTH: usize = 64;

/// An instrument identifier, e.g. `BTC-USD`.
pub type InstrumentId = String;

/// Validate an instrument identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_instrument(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Instrument cannot be empty");
    }
    if name.len() > MAX_INSTRUMENT_LENGTH {
        return Err("Instrument too long");
    }
    if !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err("Instrument contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_validation() {
        assert!(validate_instrument("BTC-USD").is_ok());
        assert!(validate_instrument("ES.FUT/2024:H").is_ok());
        assert!(validate_instrument("").is_err());
        assert!(validate_instrument("BTC USD").is_err());
        assert!(validate_instrument("BTC\n").is_err());
        assert!(validate_instrument("ÉTH").is_err());

        let long_name = "A".repeat(MAX_INSTRUMENT_LENGTH + 1);
        assert!(validate_instrument(&long_name).is_err());
    }
}
