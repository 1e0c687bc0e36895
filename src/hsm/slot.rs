//! Finding the slot that holds a token.

use log::{debug, error};

use crate::error::HsmError;

use super::provider::{Provider, SlotId, pad_label};

/// Returns the first slot whose token carries the given label.
///
/// Slots are tried in the order the provider reports them.
pub fn find_slot(provider: &Provider, token_label: &str) -> Result<SlotId, HsmError> {
    let slots = provider.slots_with_token().map_err(|err| {
        error!("Could not list slots of provider {}: {}", provider.name(), err);
        HsmError::Device(err)
    })?;

    let wanted = pad_label(token_label);
    for slot in slots {
        match provider.token_label(slot) {
            Ok(label) if label == wanted => {
                debug!("Found token '{}' in slot {}", token_label, slot);
                return Ok(slot);
            }
            Ok(_) => {}
            // A token pulled in the meantime is simply not ours.
            Err(err) => debug!("Skipping slot {}: {}", slot, err),
        }
    }
    Err(HsmError::RepositoryNotFound(token_label.to_string()))
}


//------------ Tests ---------------------------------------------------------
