//! Chat transports for the SkillRelay bridge.
//!
//! Each channel supplies the pieces [`skillrelay_bridge::Bridge`] needs: an
//! event source, a [`skillrelay_bridge::ReplySink`] and a prompt builder.
//!
//! | channel | inbound | outbound |
//! |---|---|---|
//! | [`crm`] | polling `GET /api/bridge/messages` | `POST /api/bridge/respond` |
//! | [`slack`] | Socket Mode WebSocket | Web API, reactions as markers |
//! | [`twilio`] | axum webhook `POST /sms` | Messages REST API |

pub mod config;
pub mod crm;
pub mod error;
pub mod slack;
pub mod twilio;

pub use crm::{CrmClient, CrmPoller, CrmPrompt, CrmSink, CrmStatus, bridge_token, crm_source};
pub use error::{ChannelError, Result};
pub use slack::{
    ActiveThreads, SlackClient, SlackPrompt, SlackSink, SlackTokens, SocketModeListener,
    scan_orphans,
};
pub use twilio::{TwilioClient, TwilioConfig, TwilioSink, WebhookState, serve_webhook};
