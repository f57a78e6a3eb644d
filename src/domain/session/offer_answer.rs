//! Offer/answer storage
//!
//! Holds at most one local offer and one answer per session. Nothing here
//! inspects the descriptions; codec negotiation belongs to the caller.

/// Offer/answer slots for one session, generic over the description type
#[derive(Debug, Clone, PartialEq)]
pub struct OfferAnswer<D> {
    offer: Option<D>,
    answer: Option<D>,
}

impl<D> Default for OfferAnswer<D> {
    fn default() -> Self {
        Self {
            offer: None,
            answer: None,
        }
    }
}

impl<D: Clone> OfferAnswer<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the local offer used to build the initiating request.
    /// Replaces any previous offer.
    pub fn provide_offer(&mut self, offer: D) {
        self.offer = Some(offer);
    }

    /// Store the description sent in a 2xx or attached to a 1xx, or the
    /// one received from the peer. Replaces any previous answer.
    pub fn provide_answer(&mut self, answer: D) {
        self.answer = Some(answer);
    }

    pub fn offer(&self) -> Option<&D> {
        self.offer.as_ref()
    }

    pub fn answer(&self) -> Option<&D> {
        self.answer.as_ref()
    }

    pub fn has_answer(&self) -> bool {
        self.answer.is_some()
    }

    /// The stored answer, whether it was provided for provisional or final
    /// signaling. Callers tell the two apart from the session state.
    pub fn early_media(&self) -> Option<D> {
        self.answer.clone()
    }
}
