mod stream_bot;
pub use stream_bot::{StreamBot, StreamBotBuilder};
