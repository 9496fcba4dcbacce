//! Playback session manager
//!
//! The Player starts sounds from resource keys, raw bytes or files, hands
//! back a handle per sound, and reclaims each session exactly once: either
//! when its stream runs out or when an explicit stop's fade-out ends.

use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::{ FadeConfig, PlayerConfig };
use crate::decoder::{ self, DecodeError };
use crate::handles::{ HandleError, HandleTable, PlaybackHandle, PlaybackSession, SessionState };
use crate::mixer::{ Mixer, VoiceStream };
use crate::output::{ DeviceError, OutputDevice };
use crate::resample::{ self, ResampleError };
use crate::resource::{ ResourceError, ResourceStore };
use crate::stream::{ Looped, Streamer };


/// Source label for sessions started from caller-supplied bytes.
const BYTES_SOURCE: &str = "<bytes>";


/// Errors that can occur when starting playback.
#[derive( Debug, Error )]
pub enum PlayError {
    #[error( transparent )]
    Resource( #[from] ResourceError ),

    #[error( transparent )]
    Decode( #[from] DecodeError ),

    #[error( transparent )]
    Device( #[from] DeviceError ),

    #[error( transparent )]
    Resample( #[from] ResampleError ),

    #[error( "Failed to read {path:?}: {source}" )]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error( "Failed to spawn playback thread: {0}" )]
    Spawn( #[source] std::io::Error ),
}


impl PlayError {
    /// Failure sentinel reported across the C boundary. Always negative.
    pub fn code( &self ) -> i64 {
        match self {
            PlayError::Resource( ResourceError::NotFound( _ ) ) => -1,
            PlayError::Resource( ResourceError::Io { .. } ) | PlayError::File { .. } => -2,
            PlayError::Resource( ResourceError::CorruptData { .. } ) => -3,
            PlayError::Decode( _ ) => -4,
            PlayError::Device( _ ) => -5,
            PlayError::Resample( _ ) | PlayError::Spawn( _ ) => -6,
        }
    }
}


/// A running fade-out started by `Player::stop`.
///
/// Dropping it lets the fade finish in the background.
#[derive( Debug )]
pub struct Fade {
    handle: PlaybackHandle,
    thread: thread::JoinHandle<()>,
}


impl Fade {
    pub fn handle( &self ) -> PlaybackHandle {
        self.handle
    }


    pub fn is_finished( &self ) -> bool {
        self.thread.is_finished()
    }


    /// Blocks until the voice has faded out and been closed.
    pub fn wait( self ) {
        if self.thread.join().is_err() {
            tracing::error!( "Fade thread for {} panicked", self.handle );
        }
    }
}


/// Multi-voice sound player.
pub struct Player {
    device: Arc<dyn OutputDevice>,
    resources: ResourceStore,
    table: Arc<HandleTable>,
    config: PlayerConfig,
}


impl Player {
    /// Creates a player mixing into `device` and resolving keys from `resources`.
    ///
    /// The device is opened lazily, at the rate of the first sound played.
    pub fn new( device: Arc<dyn OutputDevice>, resources: ResourceStore, config: PlayerConfig ) -> Self {
        Self {
            device,
            resources,
            table: Arc::new( HandleTable::new() ),
            config,
        }
    }


    pub fn device( &self ) -> &Arc<dyn OutputDevice> {
        &self.device
    }


    pub fn resources( &self ) -> &ResourceStore {
        &self.resources
    }


    pub fn config( &self ) -> &PlayerConfig {
        &self.config
    }


    /// Plays the resource stored under `key` once.
    pub fn play_key( &self, key: &str ) -> Result<PlaybackHandle, PlayError> {
        let bytes = self.resources.resolve( key )?;
        self.start( key, &bytes, None, false )
    }


    /// Plays the resource stored under `key` until stopped.
    pub fn play_key_looped( &self, key: &str ) -> Result<PlaybackHandle, PlayError> {
        let bytes = self.resources.resolve( key )?;
        self.start( key, &bytes, None, true )
    }


    /// Plays an encoded WAV or MP3 buffer once.
    pub fn play_bytes( &self, bytes: &[u8] ) -> Result<PlaybackHandle, PlayError> {
        self.start( BYTES_SOURCE, bytes, None, false )
    }


    /// Plays an encoded WAV or MP3 buffer until stopped.
    pub fn play_bytes_looped( &self, bytes: &[u8] ) -> Result<PlaybackHandle, PlayError> {
        self.start( BYTES_SOURCE, bytes, None, true )
    }


    /// Plays a file, decoding it as the container its extension names.
    ///
    /// Files without an extension are sniffed like raw bytes.
    pub fn play_file( &self, path: &Path, looping: bool ) -> Result<PlaybackHandle, PlayError> {
        let bytes = std::fs::read( path )
            .map_err( |source| PlayError::File { path: path.to_path_buf(), source } )?;
        let extension = path.extension().and_then( |e| e.to_str() );
        self.start( &path.display().to_string(), &bytes, extension, looping )
    }


    fn start(
        &self,
        source: &str,
        bytes: &[u8],
        extension: Option<&str>,
        looping: bool,
    ) -> Result<PlaybackHandle, PlayError> {
        let ( stream, format ) = match extension {
            Some( ext ) => decoder::decode_with_hint( bytes, ext )?,
            None => decoder::decode( bytes )?,
        };

        let device_format = self.device.init(
            format.sample_rate,
            self.config.buffer_frames( format.sample_rate ),
        )?;

        let stream = if device_format.sample_rate == format.sample_rate {
            stream
        } else if self.config.resample {
            resample::resample_stream( stream, device_format.sample_rate )?
        } else {
            tracing::warn!(
                "{} is {} Hz but the device runs at {} Hz; playing unconverted",
                source,
                format.sample_rate,
                device_format.sample_rate
            );
            stream
        };

        let voice: VoiceStream = if looping {
            Box::new( Looped::new( stream ) )
        } else {
            Box::new( stream )
        };

        let session = PlaybackSession::new( source, format.sample_rate, format.channels, looping );
        let ( done_tx, done_rx ) = oneshot::channel();

        // Register and submit together so a completion can never find the
        // voice without its session
        let handle = {
            let mut mixer = self.device.mixer().lock();
            let handle = self.table.insert( session );
            mixer.submit( handle, voice, done_tx );
            handle
        };

        let device = Arc::clone( &self.device );
        let table = Arc::clone( &self.table );
        let listener = thread::Builder::new()
            .name( format!( "soundbox-listen-{}", handle.get() ) )
            .spawn( move || await_completion( device.mixer(), &table, handle, done_rx ) );

        if let Err( e ) = listener {
            let mut mixer = self.device.mixer().lock();
            if self.table.remove( handle ).is_ok() {
                close_voice( &mut mixer.detach( handle ) );
            }
            return Err( PlayError::Spawn( e ) );
        }

        tracing::info!(
            "Playing {} as {}: {} {} Hz, {} ch, {} frames{}",
            source,
            handle,
            format.container,
            format.sample_rate,
            format.channels,
            format.frames,
            if looping { ", looping" } else { "" }
        );

        Ok( handle )
    }


    /// Stops a sound with a fade-out.
    ///
    /// The handle is invalid as soon as this returns. Returns `None` if the
    /// handle was not live, which is not an error.
    pub fn stop( &self, handle: PlaybackHandle ) -> Option<Fade> {
        let session = match self.table.remove( handle ) {
            Ok( session ) => session,
            Err( e ) => {
                tracing::debug!( "Stop ignored: {}", e );
                return None;
            }
        };

        tracing::info!( "Stopping {} ({})", handle, session.source );

        let device = Arc::clone( &self.device );
        let fade = self.config.fade.clone();
        let spawned = thread::Builder::new()
            .name( format!( "soundbox-fade-{}", handle.get() ) )
            .spawn( move || fade_out( device.mixer(), handle, &fade ) );

        match spawned {
            Ok( thread ) => Some( Fade { handle, thread } ),
            Err( e ) => {
                tracing::warn!( "Failed to spawn fade for {}, cutting it: {}", handle, e );
                close_voice( &mut self.device.mixer().lock().detach( handle ) );
                None
            }
        }
    }


    /// Stops every live sound. Fades run concurrently.
    pub fn stop_all( &self ) -> Vec<Fade> {
        let handles = self.table.snapshot_handles();
        tracing::info!( "Stopping {} sounds", handles.len() );

        // Handles that finish on their own meanwhile are skipped by stop
        handles.into_iter().filter_map( |h| self.stop( h ) ).collect()
    }


    /// Sets a playing sound's gain. Sounds that are fading out are refused.
    pub fn set_volume( &self, handle: PlaybackHandle, gain: f32 ) -> Result<(), HandleError> {
        let mut mixer = self.device.mixer().lock();
        if !self.table.contains( handle ) || !mixer.set_gain( handle, gain ) {
            return Err( HandleError::NotFound( handle ) );
        }
        Ok(())
    }


    /// Current target gain, including while fading out.
    pub fn volume( &self, handle: PlaybackHandle ) -> Option<f32> {
        self.device.mixer().lock().gain( handle )
    }


    /// Where the handle is in its lifecycle, or `None` once reclaimed.
    pub fn state( &self, handle: PlaybackHandle ) -> Option<SessionState> {
        let mixer = self.device.mixer().lock();
        if !mixer.contains( handle ) {
            return None;
        }
        Some( if self.table.contains( handle ) {
            SessionState::Playing
        } else {
            SessionState::Stopping
        })
    }


    pub fn session( &self, handle: PlaybackHandle ) -> Result<PlaybackSession, HandleError> {
        self.table.get( handle )
    }


    /// Live handles, in start order. Fading sounds are no longer live.
    pub fn active_handles( &self ) -> Vec<PlaybackHandle> {
        self.table.snapshot_handles()
    }


    pub fn active_count( &self ) -> usize {
        self.table.len()
    }
}


impl Drop for Player {
    /// Cuts every live sound. Detaching a voice drops its completion sender,
    /// which releases the listener thread and its hold on the device.
    fn drop( &mut self ) {
        let mut mixer = self.device.mixer().lock();
        let mut cut = 0;
        for handle in self.table.snapshot_handles() {
            if self.table.remove( handle ).is_ok() {
                close_voice( &mut mixer.detach( handle ) );
                cut += 1;
            }
        }
        if cut > 0 {
            tracing::debug!( "Player dropped, cut {} sounds", cut );
        }
    }
}


/// Closes a detached voice's stream, if there was one.
fn close_voice( stream: &mut Option<VoiceStream> ) {
    if let Some( stream ) = stream {
        stream.close();
    }
}


/// Waits for a voice to run out, then reclaims it unless a stop got there first.
fn await_completion(
    mixer: &Mixer,
    table: &HandleTable,
    handle: PlaybackHandle,
    done: oneshot::Receiver<()>,
) {
    // A closed channel means a stop detached the voice
    if done.blocking_recv().is_err() {
        return;
    }

    let mut mixer = mixer.lock();
    if table.remove( handle ).is_ok() {
        let mut stream = mixer.detach( handle );
        if let Some( err ) = stream.as_ref().and_then( |s| s.err() ) {
            tracing::warn!( "{} ended early: {}", handle, err );
        }
        close_voice( &mut stream );
        tracing::debug!( "{} completed", handle );
    }
}


/// Steps a voice's gain down to zero, then detaches and closes it.
fn fade_out( mixer: &Mixer, handle: PlaybackHandle, fade: &FadeConfig ) {
    let Some( start ) = mixer.lock().gain( handle ) else {
        return;
    };

    let interval = fade.step_interval();
    for gain in fade.schedule( start ) {
        if !mixer.lock().set_gain( handle, gain ) {
            break;
        }
        thread::sleep( interval );
    }

    close_voice( &mut mixer.lock().detach( handle ) );
    tracing::debug!( "{} faded out", handle );
}


#[cfg( test )]
mod tests {
    use std::sync::atomic::{ AtomicBool, Ordering };
    use std::time::{ Duration, Instant };

    use super::*;
    use crate::fixtures;
    use crate::output::HeadlessDevice;
    use crate::resource::tests::write_store;


    fn test_config() -> PlayerConfig {
        PlayerConfig {
            fade: FadeConfig {
                duration_ms: 100,
                steps: 5,
                ..FadeConfig::default()
            },
            buffer_ms: 10,
            resample: true,
        }
    }


    fn player_with( resources: ResourceStore ) -> Player {
        Player::new( Arc::new( HeadlessDevice::new() ), resources, test_config() )
    }


    fn player() -> Player {
        player_with( ResourceStore::empty() )
    }


    /// One second of stereo audio at 22.05 kHz.
    fn long_wav() -> Vec<u8> {
        fixtures::wav( 22050, 2, 22050 )
    }


    /// Polls `cond` until it holds or five seconds pass.
    fn wait_until( mut cond: impl FnMut() -> bool ) -> bool {
        let deadline = Instant::now() + Duration::from_secs( 5 );
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep( Duration::from_millis( 2 ) );
        }
        cond()
    }


    fn assert_drained( player: &Player ) {
        assert!( wait_until( || player.active_count() == 0 && player.device().mixer().lock().is_empty() ) );
    }


    #[test]
    fn test_play_wav_and_stop() {
        let player = player();
        let handle = player.play_bytes( &long_wav() ).unwrap();

        assert!( handle.get() > 0 );
        assert_eq!( player.state( handle ), Some( SessionState::Playing ) );
        assert_eq!( player.session( handle ).unwrap().source, BYTES_SOURCE );

        let fade = player.stop( handle ).unwrap();
        assert_eq!( fade.handle(), handle );
        assert!( player.session( handle ).is_err() );
        fade.wait();

        assert_eq!( player.state( handle ), None );
        assert_drained( &player );
    }


    #[test]
    fn test_play_mp3_and_stop() {
        let player = player();
        let handle = player.play_bytes( &fixtures::mp3( 40 ) ).unwrap();

        assert!( handle.get() > 0 );
        if let Some( fade ) = player.stop( handle ) {
            fade.wait();
        }
        assert_drained( &player );
    }


    #[test]
    fn test_malformed_registers_nothing() {
        let player = player();
        let wav = fixtures::wav( 44100, 1, 100 );

        let malformed = [
            fixtures::noise( 2048, 1 ),
            fixtures::noise( 2048, 2 ),
            wav[ ..20 ].to_vec(),
            fixtures::wav( 0, 1, 100 ),
            Vec::new(),
        ];

        for bytes in malformed {
            let err = player.play_bytes( &bytes ).unwrap_err();
            assert!( matches!( err, PlayError::Decode( _ ) ) );
            assert_eq!( err.code(), -4 );
            assert_eq!( player.active_count(), 0 );
        }

        // Nothing decoded, so the device was never opened
        assert!( player.device().format().is_none() );
    }


    #[test]
    fn test_stop_twice_is_noop() {
        let player = player();
        let handle = player.play_bytes( &long_wav() ).unwrap();

        let fade = player.stop( handle );
        assert!( fade.is_some() );
        assert!( player.stop( handle ).is_none() );
        assert_eq!( player.state( handle ), Some( SessionState::Stopping ) );

        if let Some( fade ) = fade {
            fade.wait();
        }
        assert!( player.stop( handle ).is_none() );
        assert_eq!( player.volume( handle ), None );
        assert_drained( &player );
    }


    #[test]
    fn test_natural_completion_reclaims() {
        let player = player();
        let handle = player.play_bytes( &fixtures::wav( 22050, 1, 50 ) ).unwrap();

        assert_drained( &player );
        assert_eq!( player.state( handle ), None );
        assert!( player.stop( handle ).is_none() );
    }


    #[test]
    fn test_completion_stop_race() {
        let player = player();
        let short = fixtures::wav( 22050, 1, 30 );
        let mut fades = Vec::new();
        let mut completed = 0;

        // Sweep the stop across the 10 ms mixing period so both teardown
        // paths get to run
        for delay_ms in 0..30 {
            let handle = player.play_bytes( &short ).unwrap();
            thread::sleep( Duration::from_millis( delay_ms ) );
            match player.stop( handle ) {
                Some( fade ) => fades.push( fade ),
                None => completed += 1,
            }
        }

        assert!( !fades.is_empty(), "no stop beat completion" );
        assert!( completed > 0, "no completion beat stop" );

        for fade in fades {
            fade.wait();
        }
        assert_drained( &player );
    }


    #[test]
    fn test_stop_all() {
        let player = player();
        let wav = long_wav();
        let mut handles: Vec<_> = ( 0..3 ).map( |_| player.play_bytes( &wav ).unwrap() ).collect();
        handles.push( player.play_bytes_looped( &fixtures::wav( 22050, 1, 100 ) ).unwrap() );
        handles.push( player.play_bytes_looped( &wav ).unwrap() );

        assert_eq!( player.active_handles(), handles );

        let fades = player.stop_all();
        assert_eq!( fades.len(), handles.len() );
        assert_eq!( player.active_count(), 0 );

        for fade in fades {
            fade.wait();
        }
        assert_drained( &player );
        assert!( player.stop_all().is_empty() );
    }


    #[test]
    fn test_fade_is_monotonic_and_reaches_zero() {
        let player = Arc::new( player() );
        let handle = player.play_bytes_looped( &long_wav() ).unwrap();

        let done = Arc::new( AtomicBool::new( false ) );
        let observer = {
            let player = Arc::clone( &player );
            let done = Arc::clone( &done );
            thread::spawn( move || {
                let mut seen = Vec::new();
                while !done.load( Ordering::Relaxed ) {
                    if let Some( gain ) = player.volume( handle ) {
                        if seen.last() != Some( &gain ) {
                            seen.push( gain );
                        }
                    }
                    thread::sleep( Duration::from_millis( 1 ) );
                }
                seen
            })
        };

        thread::sleep( Duration::from_millis( 20 ) );
        player.stop( handle ).unwrap().wait();
        done.store( true, Ordering::Relaxed );

        let seen = observer.join().unwrap();
        assert!( seen.len() > 2 );
        assert!( seen.windows( 2 ).all( |w| w[ 1 ] <= w[ 0 ] ) );
        assert_eq!( seen.last(), Some( &0.0 ) );
        assert!( seen.iter().all( |g| *g >= 0.0 ) );
    }


    #[test]
    fn test_missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let player = player_with( ResourceStore::load( dir.path() ) );

        let err = player.play_key( "anything" ).unwrap_err();
        assert!( matches!( err, PlayError::Resource( ResourceError::NotFound( _ ) ) ) );
        assert_eq!( err.code(), -1 );
        assert!( player.play_key_looped( "anything" ).is_err() );
        assert_eq!( player.active_count(), 0 );
    }


    #[test]
    fn test_play_key() {
        let dir = tempfile::tempdir().unwrap();
        let wav = long_wav();
        write_store( dir.path(), &[ ( "chime", 1, wav.as_slice() ) ] );
        let player = player_with( ResourceStore::load( dir.path() ) );

        let once = player.play_key( "chime" ).unwrap();
        let looped = player.play_key_looped( "chime" ).unwrap();

        let session = player.session( looped ).unwrap();
        assert_eq!( session.source, "chime" );
        assert!( session.looping );
        assert!( !player.session( once ).unwrap().looping );

        for fade in player.stop_all() {
            fade.wait();
        }
        assert_drained( &player );
    }


    #[test]
    fn test_same_buffer_distinct_handles() {
        let player = player();
        let wav = long_wav();
        let first = player.play_bytes( &wav ).unwrap();
        let second = player.play_bytes( &wav ).unwrap();
        assert_ne!( first, second );

        player.stop( first ).unwrap().wait();
        assert_eq!( player.state( second ), Some( SessionState::Playing ) );

        player.stop( second ).unwrap().wait();
        assert_drained( &player );
    }


    #[test]
    fn test_handles_not_reused() {
        let player = player();
        let short = fixtures::wav( 22050, 1, 30 );

        let first = player.play_bytes( &short ).unwrap();
        assert_drained( &player );
        let second = player.play_bytes( &short ).unwrap();

        assert!( second > first );
        assert_drained( &player );
    }


    #[test]
    fn test_looping_outlives_its_length() {
        let player = player();
        // 10 ms of audio
        let handle = player.play_bytes_looped( &fixtures::wav( 22050, 1, 220 ) ).unwrap();

        thread::sleep( Duration::from_millis( 100 ) );
        assert_eq!( player.state( handle ), Some( SessionState::Playing ) );

        player.stop( handle ).unwrap().wait();
        assert_drained( &player );
    }


    #[test]
    fn test_set_volume() {
        let player = player();
        let handle = player.play_bytes( &long_wav() ).unwrap();

        player.set_volume( handle, 0.4 ).unwrap();
        assert_eq!( player.volume( handle ), Some( 0.4 ) );

        player.set_volume( handle, -1.0 ).unwrap();
        assert_eq!( player.volume( handle ), Some( 0.0 ) );

        let fade = player.stop( handle ).unwrap();
        assert_eq!( player.set_volume( handle, 1.0 ), Err( HandleError::NotFound( handle ) ) );
        fade.wait();
    }


    #[test]
    fn test_resamples_to_device_rate() {
        let player = player();
        let first = player.play_bytes( &long_wav() ).unwrap();
        let other = player.play_bytes( &fixtures::wav( 11025, 1, 11025 ) ).unwrap();
        // Lengths the resampler consumes in whole chunks start too
        for frames in [ 256, 512, 516, 1024 ] {
            player.play_bytes( &fixtures::wav( 11025, 1, frames ) ).unwrap();
        }

        assert_eq!( player.device().format().map( |f| f.sample_rate ), Some( 22050 ) );
        // Sessions report the rate the sound was encoded at
        assert_eq!( player.session( other ).unwrap().sample_rate, 11025 );
        assert_eq!( player.session( first ).unwrap().sample_rate, 22050 );

        for fade in player.stop_all() {
            fade.wait();
        }
        assert_drained( &player );
    }


    #[test]
    fn test_play_file() {
        let dir = tempfile::tempdir().unwrap();
        let wav_path = dir.path().join( "beep.WAV" );
        let ogg_path = dir.path().join( "beep.ogg" );
        let bare_path = dir.path().join( "beep" );
        std::fs::write( &wav_path, long_wav() ).unwrap();
        std::fs::write( &ogg_path, long_wav() ).unwrap();
        std::fs::write( &bare_path, long_wav() ).unwrap();

        let player = player();
        let handle = player.play_file( &wav_path, false ).unwrap();
        assert!( player.session( handle ).unwrap().source.ends_with( "beep.WAV" ) );

        let err = player.play_file( &ogg_path, false ).unwrap_err();
        assert!( matches!( err, PlayError::Decode( DecodeError::UnknownExtension( _ ) ) ) );

        assert!( player.play_file( &bare_path, true ).is_ok() );

        let err = player.play_file( &dir.path().join( "missing.wav" ), false ).unwrap_err();
        assert!( matches!( err, PlayError::File { .. } ) );
        assert_eq!( err.code(), -2 );

        for fade in player.stop_all() {
            fade.wait();
        }
        assert_drained( &player );
    }


    #[test]
    fn test_drop_releases_device() {
        let device: Arc<dyn OutputDevice> = Arc::new( HeadlessDevice::new() );
        let player = Player::new( Arc::clone( &device ), ResourceStore::empty(), test_config() );

        player.play_bytes_looped( &long_wav() ).unwrap();
        player.play_bytes( &long_wav() ).unwrap();
        drop( player );

        assert!( wait_until( || Arc::strong_count( &device ) == 1 ) );
        assert!( device.mixer().lock().is_empty() );
    }


    #[test]
    fn test_fade_out_closes_voice() {
        let mixer = Mixer::new( 1 );
        let handle = PlaybackHandle::from_raw( 4 ).unwrap();
        let ( tx, mut rx ) = oneshot::channel();
        let stream = crate::stream::SampleStream::new( vec![ 0.5; 1000 ], 1, 1000 );
        mixer.lock().submit( handle, Box::new( stream ), tx );

        let fade = FadeConfig { duration_ms: 10, steps: 2, ..FadeConfig::default() };
        fade_out( &mixer, handle, &fade );

        assert!( !mixer.lock().contains( handle ) );
        assert!( rx.try_recv().is_err() );

        // A second fade on a detached voice does nothing
        fade_out( &mixer, handle, &fade );
    }
}
