// 播放器核心模块

pub mod audio_player;
pub mod event_queue;
pub mod listener;
pub mod manager;
pub mod playback_events;
pub mod prefetcher;
pub mod source;
pub mod track;

#[cfg(feature = "ffmpeg")]
pub mod decoder;
#[cfg(feature = "ffmpeg")]
pub mod demuxer;

#[cfg(feature = "cpal-output")]
pub mod audio_output;

#[cfg(test)]
pub mod test_support;

pub use audio_player::{default_audio_player_factory, AudioPlayer, AudioPlayerFactory, AudioSink, DefaultAudioPlayer};
pub use event_queue::{EventId, PendingEvent, TimedEventQueue};
pub use listener::{ChannelListener, ErrorKind, MediaEvent, PlayerListener};
pub use manager::PlaybackManager;
pub use prefetcher::{Prefetcher, ReadAheadPrefetcher};
pub use source::{DataSource, ExtractorFactory, FileSource, MediaExtractor};
pub use track::MediaTrack;

#[cfg(feature = "ffmpeg")]
pub use demuxer::FfmpegExtractorFactory;

#[cfg(feature = "cpal-output")]
pub use audio_output::CpalAudioSink;
