// Route module decomposition — each surface area in its own file.
// Shared request guards live here; route functions in submodules.

mod conversations;
mod system;
mod webhook_routes;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use conversations::{
    get_conversations, post_conversation_response, start_conversation, tool_selector,
};
pub use system::{health, not_found, stats};
pub use webhook_routes::agent_response;

// --- Shared request guards ---

use rocket::request::{FromRequest, Outcome, Request};

/// `X-Letta-Signature: t=<unix>,v1=<hex>` header, when present.
pub struct LettaSignature(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for LettaSignature {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(LettaSignature(
            req.headers()
                .get_one("X-Letta-Signature")
                .map(|s| s.to_string()),
        ))
    }
}
