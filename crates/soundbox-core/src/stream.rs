//! Sample streams
//!
//! A stream hands out interleaved `f32` samples in its own channel layout.
//! Adapters wrap an owned inner stream: `Looped` repeats it forever and
//! `Gain` scales it by a mutable linear gain.

use thiserror::Error;


/// Number of frames the gain stage takes to reach a new target gain.
pub const GAIN_RAMP_FRAMES: u32 = 64;


/// Terminal stream errors, reported through `Streamer::err` instead of
/// interrupting playback.
#[derive( Debug, Clone, PartialEq, Error )]
pub enum StreamError {
    #[error( "Decode failed mid-stream: {0}" )]
    Decode( String ),

    #[error( "Seek to frame {frame} is past the end ({len} frames)" )]
    SeekOutOfRange { frame: usize, len: usize },
}


/// A source of interleaved samples.
pub trait Streamer: Send {
    /// Fills `buf` with interleaved samples and returns how many were written.
    ///
    /// Only whole frames are written. A return value shorter than `buf.len()`
    /// (rounded down to whole frames) means the stream is drained.
    fn stream( &mut self, buf: &mut [f32] ) -> usize;

    /// Number of interleaved channels.
    fn channels( &self ) -> u16;

    /// Terminal error hit while producing samples, if any.
    fn err( &self ) -> Option<&StreamError>;

    /// Releases the stream's samples. A closed stream yields nothing.
    fn close( &mut self );
}


/// A stream that can be repositioned.
pub trait Seekable: Streamer {
    /// Total length in frames.
    fn len( &self ) -> usize;

    /// Current position in frames.
    fn position( &self ) -> usize;

    fn seek( &mut self, frame: usize ) -> Result<(), StreamError>;

    fn is_empty( &self ) -> bool {
        self.len() == 0
    }
}


impl<S: Streamer + ?Sized> Streamer for Box<S> {
    fn stream( &mut self, buf: &mut [f32] ) -> usize {
        ( **self ).stream( buf )
    }

    fn channels( &self ) -> u16 {
        ( **self ).channels()
    }

    fn err( &self ) -> Option<&StreamError> {
        ( **self ).err()
    }

    fn close( &mut self ) {
        ( **self ).close()
    }
}


/// Fully decoded audio held in memory.
#[derive( Debug, Clone )]
pub struct SampleStream {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
    /// Read position in frames
    position: usize,
    closed: bool,
    error: Option<StreamError>,
}


impl SampleStream {
    /// Creates a stream over interleaved samples.
    ///
    /// Trailing samples that do not form a whole frame are dropped.
    pub fn new( mut samples: Vec<f32>, channels: u16, sample_rate: u32 ) -> Self {
        let channels = channels.max( 1 );
        let whole = samples.len() - samples.len() % channels as usize;
        samples.truncate( whole );

        Self {
            samples,
            channels,
            sample_rate,
            position: 0,
            closed: false,
            error: None,
        }
    }


    /// Attaches a terminal error that occurred while the samples were produced.
    pub fn with_error( mut self, error: Option<StreamError> ) -> Self {
        self.error = error;
        self
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    /// Interleaved samples held by the stream.
    pub fn samples( &self ) -> &[f32] {
        &self.samples
    }


    /// Splits the stream into its samples and pending error.
    pub fn into_parts( self ) -> ( Vec<f32>, Option<StreamError> ) {
        ( self.samples, self.error )
    }


    pub fn is_closed( &self ) -> bool {
        self.closed
    }
}


impl Streamer for SampleStream {
    fn stream( &mut self, buf: &mut [f32] ) -> usize {
        if self.closed {
            return 0;
        }

        let ch = self.channels as usize;
        let wanted_frames = buf.len() / ch;
        let frames = wanted_frames.min( self.len() - self.position );
        let start = self.position * ch;
        let count = frames * ch;

        buf[ ..count ].copy_from_slice( &self.samples[ start..start + count ] );
        self.position += frames;
        count
    }

    fn channels( &self ) -> u16 {
        self.channels
    }

    fn err( &self ) -> Option<&StreamError> {
        self.error.as_ref()
    }

    fn close( &mut self ) {
        self.closed = true;
        self.samples = Vec::new();
        self.position = 0;
    }
}


impl Seekable for SampleStream {
    fn len( &self ) -> usize {
        self.samples.len() / self.channels as usize
    }

    fn position( &self ) -> usize {
        self.position
    }

    fn seek( &mut self, frame: usize ) -> Result<(), StreamError> {
        let len = self.len();
        if frame > len {
            return Err( StreamError::SeekOutOfRange { frame, len } );
        }
        self.position = frame;
        Ok(())
    }
}


/// Repeats an inner stream forever.
pub struct Looped<S> {
    inner: S,
}


impl<S: Seekable> Looped<S> {
    pub fn new( inner: S ) -> Self {
        Self { inner }
    }


    pub fn into_inner( self ) -> S {
        self.inner
    }
}


impl<S: Seekable> Streamer for Looped<S> {
    fn stream( &mut self, buf: &mut [f32] ) -> usize {
        let ch = self.inner.channels() as usize;
        let wanted = buf.len() - buf.len() % ch;
        let mut written = 0;

        while written < wanted {
            let n = self.inner.stream( &mut buf[ written..wanted ] );
            written += n;
            if written == wanted {
                break;
            }

            // Drained: rewind, unless there is nothing to replay
            if self.inner.is_empty() || self.inner.seek( 0 ).is_err() {
                break;
            }
        }

        written
    }

    fn channels( &self ) -> u16 {
        self.inner.channels()
    }

    fn err( &self ) -> Option<&StreamError> {
        self.inner.err()
    }

    fn close( &mut self ) {
        self.inner.close()
    }
}


/// Linear gain stage.
///
/// Changes to the gain are ramped over `GAIN_RAMP_FRAMES` frames so a stepped
/// fade never produces a discontinuity in the output.
pub struct Gain<S> {
    inner: S,
    /// Target gain set by the owner
    gain: f32,
    /// Gain applied to the most recent frame
    applied: f32,
}


impl<S: Streamer> Gain<S> {
    /// Wraps a stream at unity gain.
    pub fn new( inner: S ) -> Self {
        Self {
            inner,
            gain: 1.0,
            applied: 1.0,
        }
    }


    /// Target gain.
    pub fn gain( &self ) -> f32 {
        self.gain
    }


    /// Gain applied to the last frame produced.
    pub fn applied_gain( &self ) -> f32 {
        self.applied
    }


    /// Sets the target gain. Negative and non-finite values clamp to zero.
    pub fn set_gain( &mut self, gain: f32 ) {
        self.gain = if gain.is_finite() { gain.max( 0.0 ) } else { 0.0 };
    }


    pub fn inner( &self ) -> &S {
        &self.inner
    }


    /// Detaches the inner stream from the gain stage.
    pub fn into_inner( self ) -> S {
        self.inner
    }
}


impl<S: Streamer> Streamer for Gain<S> {
    fn stream( &mut self, buf: &mut [f32] ) -> usize {
        let n = self.inner.stream( buf );
        let ch = self.inner.channels() as usize;
        let step = 1.0 / GAIN_RAMP_FRAMES as f32;

        for frame in buf[ ..n ].chunks_mut( ch ) {
            if self.applied != self.gain {
                let delta = self.gain - self.applied;
                self.applied = if delta.abs() <= step {
                    self.gain
                } else {
                    self.applied + step.copysign( delta )
                };
            }
            for sample in frame.iter_mut() {
                *sample *= self.applied;
            }
        }

        n
    }

    fn channels( &self ) -> u16 {
        self.inner.channels()
    }

    fn err( &self ) -> Option<&StreamError> {
        self.inner.err()
    }

    fn close( &mut self ) {
        self.inner.close()
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn ramp( frames: usize, channels: u16 ) -> SampleStream {
        let samples = ( 0..frames * channels as usize ).map( |i| i as f32 ).collect();
        SampleStream::new( samples, channels, 44100 )
    }


    #[test]
    fn test_sample_stream_drains() {
        let mut stream = ramp( 3, 2 );
        let mut buf = [ 0.0; 4 ];

        assert_eq!( stream.stream( &mut buf ), 4 );
        assert_eq!( buf, [ 0.0, 1.0, 2.0, 3.0 ] );
        assert_eq!( stream.stream( &mut buf ), 2 );
        assert_eq!( &buf[ ..2 ], &[ 4.0, 5.0 ] );
        assert_eq!( stream.stream( &mut buf ), 0 );
    }


    #[test]
    fn test_sample_stream_drops_partial_frame() {
        let stream = SampleStream::new( vec![ 0.1, 0.2, 0.3 ], 2, 8000 );
        assert_eq!( stream.len(), 1 );
        assert_eq!( stream.samples(), &[ 0.1, 0.2 ] );
    }


    #[test]
    fn test_sample_stream_only_whole_frames() {
        let mut stream = ramp( 4, 2 );
        let mut buf = [ 0.0; 3 ];
        assert_eq!( stream.stream( &mut buf ), 2 );
        assert_eq!( stream.position(), 1 );
    }


    #[test]
    fn test_closed_stream_yields_nothing() {
        let mut stream = ramp( 10, 1 );
        stream.close();
        stream.close();

        let mut buf = [ 0.0; 4 ];
        assert!( stream.is_closed() );
        assert_eq!( stream.stream( &mut buf ), 0 );
    }


    #[test]
    fn test_seek_bounds() {
        let mut stream = ramp( 5, 1 );
        assert!( stream.seek( 5 ).is_ok() );
        assert_eq!(
            stream.seek( 6 ),
            Err( StreamError::SeekOutOfRange { frame: 6, len: 5 } )
        );
    }


    #[test]
    fn test_error_side_channel() {
        let stream = ramp( 1, 1 ).with_error( Some( StreamError::Decode( "bad packet".into() ) ) );
        assert!( matches!( stream.err(), Some( StreamError::Decode( _ ) ) ) );
    }


    #[test]
    fn test_looped_wraps_around() {
        let mut looped = Looped::new( ramp( 3, 1 ) );
        let mut buf = [ 0.0; 8 ];

        assert_eq!( looped.stream( &mut buf ), 8 );
        assert_eq!( buf, [ 0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0 ] );
    }


    #[test]
    fn test_looped_empty_does_not_spin() {
        let mut looped = Looped::new( SampleStream::new( Vec::new(), 2, 44100 ) );
        let mut buf = [ 0.0; 16 ];
        assert_eq!( looped.stream( &mut buf ), 0 );
    }


    #[test]
    fn test_looped_closed_stops() {
        let mut looped = Looped::new( ramp( 4, 1 ) );
        looped.close();
        let mut buf = [ 0.0; 16 ];
        assert_eq!( looped.stream( &mut buf ), 0 );
    }


    #[test]
    fn test_gain_clamps_negative() {
        let mut gain = Gain::new( ramp( 1, 1 ) );
        gain.set_gain( -0.5 );
        assert_eq!( gain.gain(), 0.0 );
        gain.set_gain( f32::NAN );
        assert_eq!( gain.gain(), 0.0 );
    }


    #[test]
    fn test_gain_ramps_toward_target() {
        let frames = GAIN_RAMP_FRAMES as usize * 2;
        let mut gain = Gain::new( SampleStream::new( vec![ 1.0; frames ], 1, 44100 ) );
        gain.set_gain( 0.0 );

        let mut buf = vec![ 0.0; frames ];
        assert_eq!( gain.stream( &mut buf ), frames );

        // Output falls smoothly and never increases
        for pair in buf.windows( 2 ) {
            assert!( pair[ 1 ] <= pair[ 0 ] );
            assert!( pair[ 0 ] - pair[ 1 ] <= 1.0 / GAIN_RAMP_FRAMES as f32 + f32::EPSILON );
        }
        assert_eq!( buf[ frames - 1 ], 0.0 );
        assert_eq!( gain.applied_gain(), 0.0 );
    }


    #[test]
    fn test_gain_unity_passthrough() {
        let mut gain = Gain::new( ramp( 4, 2 ) );
        let mut buf = [ 0.0; 8 ];
        gain.stream( &mut buf );
        assert_eq!( buf, [ 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0 ] );
    }
}
