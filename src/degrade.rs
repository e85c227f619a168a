//! Access-mode decision per source.
//!
//! Pure policy: given whether a credential exists and whether the gateway
//! session came up, pick how (or whether) a source is scraped this run.

use crate::models::{AccessMode, Endpoint, Source};

/// Decide the access mode for one source.
///
/// `Authenticated` requires all three: the source is gated, a credential
/// was supplied, and the session established. A gated source without a
/// session falls back to its public substitute when one exists — those
/// records carry the `degraded` tag — and is `Unavailable` otherwise.
pub fn decide(source: &Source, credential_present: bool, session_established: bool) -> AccessMode {
    if !source.requires_auth {
        return AccessMode::Public;
    }
    if credential_present && session_established {
        return AccessMode::Authenticated;
    }
    if source.public.is_some() {
        AccessMode::PublicFallback
    } else {
        AccessMode::Unavailable
    }
}

/// Resolve a mode to the endpoint it reads from, plus whether the fetch
/// rides the session and whether records are tagged degraded. `None` means
/// the source contributes nothing this run.
pub fn plan(source: &Source, mode: AccessMode) -> Option<(Endpoint, bool, bool)> {
    match mode {
        AccessMode::Public => source.public.map(|e| (e, false, false)),
        AccessMode::Authenticated => source.gated.map(|e| (e, true, false)),
        AccessMode::PublicFallback => source.public.map(|e| (e, false, true)),
        AccessMode::Unavailable => None,
    }
}
