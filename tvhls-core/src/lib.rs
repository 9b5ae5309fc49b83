pub mod catalog;
pub mod config;
pub mod error;
pub mod relay;
pub mod segments;
pub mod server;
pub mod session;
pub mod transcoder;

pub use catalog::{
    channel_id_from_url, parse_catalog, render_catalog, CatalogError, CatalogResult,
    CatalogSource, ChannelRecord,
};
pub use config::{
    load_tvhls_config, PathsSection, RelaySection, ServerSection, SessionsSection,
    SweeperSection, TranscoderSection, TvhlsConfig,
};
pub use error::{ConfigError, Result};
pub use relay::{RelayError, RelayStream, UpstreamRelay};
pub use segments::{SegmentStore, SweepReport, Sweeper};
pub use server::{
    router, serve, serve_with_launcher, serve_with_listener, ApiError, AppState, ServerError,
};
pub use session::{
    Session, SessionError, SessionHandle, SessionManager, SessionResult, SessionState,
    SessionSummary,
};
pub use transcoder::{
    SystemTranscoderLauncher, TranscodeInvocation, TranscoderLauncher, TranscoderProcess,
};
