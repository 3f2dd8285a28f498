// Extractor implementations
//
// - cli: the native `yt-dlp` binary, used for probing and every transfer
// - direct: page scraping for hosts the regular extractor handles poorly

mod cli;
mod direct;

pub use cli::YtDlpCli;
pub use direct::{parse_page, DirectMedia, DirectMediaResolver, DEFAULT_DIRECT_DOMAINS};
