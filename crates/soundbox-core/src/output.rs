//! Audio output
//!
//! An output device owns a `Mixer` and, once initialized, pulls mixed
//! samples from it on its own schedule. `CpalDevice` plays through the
//! system's default output; `HeadlessDevice` runs the same mixing loop
//! against a clock without producing sound.

use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ mpsc, Arc };
use std::thread;
use std::time::Duration;

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use parking_lot::Mutex;
use thiserror::Error;

use crate::mixer::Mixer;


/// Channel layout requested from the hardware.
const PREFERRED_CHANNELS: u16 = 2;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum DeviceError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to initialize output device: {0}" )]
    InitFailed( String ),
}


/// Rate and layout the device mixes at.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}


/// A sink that mixes every voice registered with its mixer.
pub trait OutputDevice: Send + Sync {
    /// Opens the device at `sample_rate` with a buffer of `buffer_frames`.
    ///
    /// Idempotent: once the device is open, later calls return the format
    /// it was opened with, whatever rate they ask for.
    fn init( &self, sample_rate: u32, buffer_frames: usize ) -> Result<DeviceFormat, DeviceError>;

    /// Format of the open device, or `None` before `init` succeeds.
    fn format( &self ) -> Option<DeviceFormat>;

    fn mixer( &self ) -> &Mixer;
}


/// A running output thread and the means to stop it.
struct Running {
    format: DeviceFormat,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}


impl Running {
    fn stop( &mut self ) {
        // Dropping the sender wakes the output thread
        self.shutdown.take();
        if let Some( thread ) = self.thread.take() {
            let _ = thread.join();
        }
    }
}


/// Output through cpal's default host and device.
///
/// `cpal::Stream` is not `Send`, so it is created on and owned by a
/// dedicated thread that lives until the device is dropped.
pub struct CpalDevice {
    mixer: Arc<Mixer>,
    running: Mutex<Option<Running>>,
}


impl CpalDevice {
    pub fn new() -> Self {
        Self {
            mixer: Arc::new( Mixer::new( PREFERRED_CHANNELS ) ),
            running: Mutex::new( None ),
        }
    }
}


impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}


impl OutputDevice for CpalDevice {
    fn init( &self, sample_rate: u32, buffer_frames: usize ) -> Result<DeviceFormat, DeviceError> {
        let mut running = self.running.lock();
        if let Some( ref r ) = *running {
            return Ok( r.format );
        }

        let ( ready_tx, ready_rx ) = mpsc::channel();
        let ( shutdown_tx, shutdown_rx ) = mpsc::channel::<()>();
        let mixer = Arc::clone( &self.mixer );

        let thread = thread::Builder::new()
            .name( "soundbox-output".into() )
            .spawn( move || {
                let stream = match open_stream( mixer, sample_rate, buffer_frames ) {
                    Ok(( stream, format )) => {
                        let _ = ready_tx.send( Ok( format ) );
                        stream
                    }
                    Err( e ) => {
                        let _ = ready_tx.send( Err( e ) );
                        return;
                    }
                };

                // Park until the device is dropped
                let _ = shutdown_rx.recv();
                drop( stream );
                tracing::debug!( "Output thread exiting" );
            })
            .map_err( |e| DeviceError::InitFailed( e.to_string() ) )?;

        let format = match ready_rx.recv() {
            Ok( Ok( format ) ) => format,
            Ok( Err( e ) ) => {
                let _ = thread.join();
                return Err( e );
            }
            Err( _ ) => {
                let _ = thread.join();
                return Err( DeviceError::InitFailed( "output thread exited".into() ) );
            }
        };

        self.mixer.set_channels( format.channels );
        *running = Some( Running {
            format,
            shutdown: Some( shutdown_tx ),
            thread: Some( thread ),
        });

        Ok( format )
    }


    fn format( &self ) -> Option<DeviceFormat> {
        self.running.lock().as_ref().map( |r| r.format )
    }


    fn mixer( &self ) -> &Mixer {
        &self.mixer
    }
}


impl Drop for CpalDevice {
    fn drop( &mut self ) {
        if let Some( mut running ) = self.running.lock().take() {
            running.stop();
        }
    }
}


/// Builds and starts a cpal stream that pulls from `mixer`.
fn open_stream(
    mixer: Arc<Mixer>,
    sample_rate: u32,
    buffer_frames: usize,
) -> Result<( cpal::Stream, DeviceFormat ), DeviceError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or( DeviceError::NoDevice )?;

    tracing::info!( "Using output device: {:?}", device.name() );

    // Priority: 1) stereo at our rate, 2) any layout at our rate, 3) default with warning
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err( |e| DeviceError::InitFailed( e.to_string() ) )?
        .collect();

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate
    };

    let chosen = supported_configs
        .iter()
        .find( |c| c.channels() == PREFERRED_CHANNELS && supports_rate( c ) )
        .or_else( || supported_configs.iter().find( |c| supports_rate( c ) ) );

    let config = if let Some( supported_config ) = chosen {
        let buffer_size = match *supported_config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max }
                if ( min as usize ) <= buffer_frames && buffer_frames <= max as usize =>
            {
                cpal::BufferSize::Fixed( buffer_frames as u32 )
            }
            _ => cpal::BufferSize::Default,
        };

        let mut config = supported_config.clone()
            .with_sample_rate( cpal::SampleRate( sample_rate ) )
            .config();
        config.buffer_size = buffer_size;
        config
    } else {
        let default_config = device
            .default_output_config()
            .map_err( |e| DeviceError::InitFailed( e.to_string() ) )?;
        tracing::warn!(
            "Device does not support {} Hz, defaulting to {} Hz",
            sample_rate,
            default_config.sample_rate().0
        );
        default_config.config()
    };

    tracing::info!(
        "Audio output config: {} Hz, {} channels, buffer {:?}",
        config.sample_rate.0,
        config.channels,
        config.buffer_size
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer.mix( data );
            },
            |err| {
                tracing::error!( "Audio output error: {}", err );
            },
            None,
        )
        .map_err( |e| DeviceError::InitFailed( e.to_string() ) )?;

    stream
        .play()
        .map_err( |e| DeviceError::InitFailed( e.to_string() ) )?;

    let format = DeviceFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    Ok(( stream, format ))
}


/// A device with no hardware behind it.
///
/// Mixes one buffer per buffer period on a background thread and discards
/// the result, so voices progress and complete in real time.
pub struct HeadlessDevice {
    mixer: Arc<Mixer>,
    channels: u16,
    running: Mutex<Option<HeadlessRunning>>,
}


struct HeadlessRunning {
    format: DeviceFormat,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}


impl HeadlessDevice {
    /// Creates a stereo headless device.
    pub fn new() -> Self {
        Self::with_channels( PREFERRED_CHANNELS )
    }


    pub fn with_channels( channels: u16 ) -> Self {
        let channels = channels.max( 1 );
        Self {
            mixer: Arc::new( Mixer::new( channels ) ),
            channels,
            running: Mutex::new( None ),
        }
    }
}


impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}


impl OutputDevice for HeadlessDevice {
    fn init( &self, sample_rate: u32, buffer_frames: usize ) -> Result<DeviceFormat, DeviceError> {
        let mut running = self.running.lock();
        if let Some( ref r ) = *running {
            return Ok( r.format );
        }

        if sample_rate == 0 {
            return Err( DeviceError::InitFailed( "sample rate must be non-zero".into() ) );
        }

        let format = DeviceFormat { sample_rate, channels: self.channels };
        let buffer_frames = buffer_frames.max( 1 );
        let period = Duration::from_secs_f64( buffer_frames as f64 / sample_rate as f64 );
        let stop = Arc::new( AtomicBool::new( false ) );

        let mixer = Arc::clone( &self.mixer );
        let stop_clone = Arc::clone( &stop );
        let channels = self.channels as usize;

        let thread = thread::Builder::new()
            .name( "soundbox-headless".into() )
            .spawn( move || {
                let mut buffer = vec![ 0.0; buffer_frames * channels ];
                while !stop_clone.load( Ordering::Relaxed ) {
                    mixer.mix( &mut buffer );
                    thread::sleep( period );
                }
            })
            .map_err( |e| DeviceError::InitFailed( e.to_string() ) )?;

        tracing::info!(
            "Headless output: {} Hz, {} channels, {:?} period",
            sample_rate,
            self.channels,
            period
        );

        *running = Some( HeadlessRunning {
            format,
            stop,
            thread: Some( thread ),
        });

        Ok( format )
    }


    fn format( &self ) -> Option<DeviceFormat> {
        self.running.lock().as_ref().map( |r| r.format )
    }


    fn mixer( &self ) -> &Mixer {
        &self.mixer
    }
}


impl Drop for HeadlessDevice {
    fn drop( &mut self ) {
        if let Some( mut running ) = self.running.lock().take() {
            running.stop.store( true, Ordering::Relaxed );
            if let Some( thread ) = running.thread.take() {
                let _ = thread.join();
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use std::sync::Barrier;

    use tokio::sync::oneshot;

    use super::*;
    use crate::handles::PlaybackHandle;
    use crate::stream::SampleStream;


    #[test]
    fn test_headless_init_is_idempotent() {
        let device = HeadlessDevice::new();
        assert!( device.format().is_none() );

        let first = device.init( 22050, 256 ).unwrap();
        let second = device.init( 48000, 1024 ).unwrap();

        assert_eq!( first, DeviceFormat { sample_rate: 22050, channels: 2 } );
        assert_eq!( second, first );
        assert_eq!( device.format(), Some( first ) );
    }


    #[test]
    fn test_headless_init_race_single_winner() {
        let device = Arc::new( HeadlessDevice::new() );
        let barrier = Arc::new( Barrier::new( 4 ) );

        let formats: Vec<DeviceFormat> = [ 8000, 16000, 32000, 44100 ]
            .into_iter()
            .map( |rate| {
                let device = Arc::clone( &device );
                let barrier = Arc::clone( &barrier );
                thread::spawn( move || {
                    barrier.wait();
                    device.init( rate, 64 ).unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map( |t| t.join().unwrap() )
            .collect();

        assert!( formats.iter().all( |f| *f == formats[ 0 ] ) );
    }


    #[test]
    fn test_headless_rejects_zero_rate() {
        let device = HeadlessDevice::new();
        assert!( matches!( device.init( 0, 64 ), Err( DeviceError::InitFailed( _ ) ) ) );
        assert!( device.format().is_none() );
    }


    #[test]
    fn test_headless_drives_completion() {
        let device = HeadlessDevice::with_channels( 1 );
        device.init( 1000, 10 ).unwrap();

        let ( tx, rx ) = oneshot::channel();
        let stream = SampleStream::new( vec![ 0.5; 30 ], 1, 1000 );
        let handle = PlaybackHandle::from_raw( 1 ).unwrap();
        device.mixer().lock().submit( handle, Box::new( stream ), tx );

        assert!( rx.blocking_recv().is_ok() );
        assert_eq!( device.mixer().lock().is_finished( handle ), Some( true ) );
    }
}
