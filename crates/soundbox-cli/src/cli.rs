//! Command-line argument parsing for Soundbox.

use std::path::PathBuf;

use clap::{ ArgAction, Parser };


/// Soundbox - Play packed sound resources and WAV/MP3 files.
#[derive( Parser, Debug )]
#[command( name = "soundbox" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Resource root containing `datas/`. Overrides the saved setting.
    #[arg( short, long )]
    pub root: Option<PathBuf>,

    /// Loop every target until stopped.
    #[arg( short = 'l', long = "loop" )]
    pub looping: bool,

    /// Stop everything after this many seconds.
    #[arg( short, long, value_name = "SECS" )]
    pub stop_after: Option<f64>,

    /// Mix without opening an audio device.
    #[arg( long )]
    pub headless: bool,

    /// List the resource keys under the root and exit.
    #[arg( long )]
    pub list: bool,

    /// Fade-out length in milliseconds. Overrides the saved setting.
    #[arg( long, value_name = "MS" )]
    pub fade_ms: Option<u64>,

    /// Save the effective root and fade length as the new defaults.
    #[arg( long )]
    pub save: bool,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg( short, long, action = ArgAction::Count )]
    pub verbose: u8,

    /// Files or resource keys to play.
    pub targets: Vec<String>,
}


impl Args {
    /// Maximum level for the log subscriber.
    pub fn log_level( &self ) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from( [
            "soundbox", "--root", "/tmp/res", "--loop", "-s", "2.5", "-vv", "chime", "beep.wav",
        ]).unwrap();

        assert_eq!( args.root, Some( PathBuf::from( "/tmp/res" ) ) );
        assert!( args.looping );
        assert_eq!( args.stop_after, Some( 2.5 ) );
        assert_eq!( args.log_level(), tracing::Level::DEBUG );
        assert_eq!( args.targets, vec![ "chime", "beep.wav" ] );
    }


    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from( [ "soundbox" ] ).unwrap();
        assert!( !args.looping && !args.headless && !args.list );
        assert_eq!( args.log_level(), tracing::Level::WARN );
        assert!( args.targets.is_empty() );
    }
}
