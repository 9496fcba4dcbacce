//! Voice mixer
//!
//! Sums every registered voice into the device buffer, converting each
//! voice's channel layout to the device's. The mixer lock is the output
//! device's mutual-exclusion primitive: the audio callback holds it while
//! mixing, and callers hold it (through `MixerGuard`) while changing a
//! playing voice.

use parking_lot::{ Mutex, MutexGuard };
use tokio::sync::oneshot;

use crate::handles::PlaybackHandle;
use crate::stream::{ Gain, Streamer };


/// A stream as registered with the mixer.
pub type VoiceStream = Box<dyn Streamer>;


struct Voice {
    handle: PlaybackHandle,
    stream: Gain<VoiceStream>,
    /// Set once the stream came up short; the voice is skipped afterwards
    finished: bool,
    done: Option<oneshot::Sender<()>>,
}


struct MixerState {
    /// Device channel count
    channels: u16,
    voices: Vec<Voice>,
    /// Per-voice staging buffer in the voice's own layout
    scratch: Vec<f32>,
}


/// Mixes all voices into one interleaved output.
pub struct Mixer {
    state: Mutex<MixerState>,
}


impl Mixer {
    /// Creates an empty mixer producing `channels` output channels.
    pub fn new( channels: u16 ) -> Self {
        Self {
            state: Mutex::new( MixerState {
                channels: channels.max( 1 ),
                voices: Vec::new(),
                scratch: Vec::new(),
            }),
        }
    }


    /// Takes the mixer lock.
    pub fn lock( &self ) -> MixerGuard<'_> {
        MixerGuard { state: self.state.lock() }
    }


    pub fn channels( &self ) -> u16 {
        self.state.lock().channels
    }


    /// Changes the output layout. Called by the device once it knows it.
    pub fn set_channels( &self, channels: u16 ) {
        self.state.lock().channels = channels.max( 1 );
    }


    /// Fills `out` with the sum of all voices.
    ///
    /// A voice that cannot fill its share of the buffer is marked finished
    /// and its completion signal fires. It stays registered, silent, until
    /// its owner detaches it.
    pub fn mix( &self, out: &mut [f32] ) {
        out.fill( 0.0 );

        let mut state = self.state.lock();
        let MixerState { channels, voices, scratch } = &mut *state;
        let out_ch = *channels as usize;
        let frames = out.len() / out_ch;

        for voice in voices.iter_mut().filter( |v| !v.finished ) {
            let src_ch = voice.stream.channels().max( 1 ) as usize;
            let wanted = frames * src_ch;
            scratch.clear();
            scratch.resize( wanted, 0.0 );

            let got = voice.stream.stream( scratch ) / src_ch;
            accumulate( &scratch[ ..got * src_ch ], src_ch, &mut out[ ..got * out_ch ], out_ch );

            if got < frames {
                voice.finished = true;
                if let Some( done ) = voice.done.take() {
                    // The listener may already be gone
                    let _ = done.send(());
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp( -1.0, 1.0 );
        }
    }
}


/// Adds `src` (in `src_ch` layout) onto `dst` (in `dst_ch` layout).
fn accumulate( src: &[f32], src_ch: usize, dst: &mut [f32], dst_ch: usize ) {
    if src_ch == dst_ch {
        for ( d, s ) in dst.iter_mut().zip( src ) {
            *d += s;
        }
    } else if src_ch == 1 {
        // Mono to many: duplicate each sample
        for ( frame, s ) in dst.chunks_exact_mut( dst_ch ).zip( src ) {
            for d in frame {
                *d += s;
            }
        }
    } else if dst_ch == 1 {
        // Many to mono: mix down
        for ( d, frame ) in dst.iter_mut().zip( src.chunks_exact( src_ch ) ) {
            *d += frame.iter().sum::<f32>() / src_ch as f32;
        }
    } else {
        // General case: copy matching channels, repeat the last source channel
        for ( out_frame, in_frame ) in dst.chunks_exact_mut( dst_ch ).zip( src.chunks_exact( src_ch ) ) {
            for ( ch, d ) in out_frame.iter_mut().enumerate() {
                *d += in_frame[ ch.min( src_ch - 1 ) ];
            }
        }
    }
}


/// Exclusive access to the mixer's voices.
///
/// Held only for short mutations; never across a sleep.
pub struct MixerGuard<'a> {
    state: MutexGuard<'a, MixerState>,
}


impl MixerGuard<'_> {
    /// Starts mixing `stream` at unity gain. `done` fires once when the
    /// stream runs out.
    pub fn submit( &mut self, handle: PlaybackHandle, stream: VoiceStream, done: oneshot::Sender<()> ) {
        self.state.voices.push( Voice {
            handle,
            stream: Gain::new( stream ),
            finished: false,
            done: Some( done ),
        });
    }


    fn voice( &self, handle: PlaybackHandle ) -> Option<&Voice> {
        self.state.voices.iter().find( |v| v.handle == handle )
    }


    fn voice_mut( &mut self, handle: PlaybackHandle ) -> Option<&mut Voice> {
        self.state.voices.iter_mut().find( |v| v.handle == handle )
    }


    pub fn contains( &self, handle: PlaybackHandle ) -> bool {
        self.voice( handle ).is_some()
    }


    /// Whether the voice has run out of samples.
    pub fn is_finished( &self, handle: PlaybackHandle ) -> Option<bool> {
        self.voice( handle ).map( |v| v.finished )
    }


    pub fn gain( &self, handle: PlaybackHandle ) -> Option<f32> {
        self.voice( handle ).map( |v| v.stream.gain() )
    }


    /// Sets a voice's target gain. Returns false if the voice is not registered.
    pub fn set_gain( &mut self, handle: PlaybackHandle, gain: f32 ) -> bool {
        match self.voice_mut( handle ) {
            Some( voice ) => {
                voice.stream.set_gain( gain );
                true
            }
            None => false,
        }
    }


    /// Unregisters a voice and hands back its stream, detached from the
    /// gain stage. Dropping the voice drops its completion sender.
    pub fn detach( &mut self, handle: PlaybackHandle ) -> Option<VoiceStream> {
        let idx = self.state.voices.iter().position( |v| v.handle == handle )?;
        let voice = self.state.voices.swap_remove( idx );
        Some( voice.stream.into_inner() )
    }


    /// Number of registered voices, finished ones included.
    pub fn len( &self ) -> usize {
        self.state.voices.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.state.voices.is_empty()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::stream::{ SampleStream, GAIN_RAMP_FRAMES };


    fn handle( raw: u64 ) -> PlaybackHandle {
        PlaybackHandle::from_raw( raw ).unwrap()
    }


    fn constant( value: f32, frames: usize, channels: u16 ) -> VoiceStream {
        Box::new( SampleStream::new( vec![ value; frames * channels as usize ], channels, 44100 ) )
    }


    #[test]
    fn test_mix_sums_voices() {
        let mixer = Mixer::new( 2 );
        let ( tx1, _rx1 ) = oneshot::channel();
        let ( tx2, _rx2 ) = oneshot::channel();
        {
            let mut guard = mixer.lock();
            guard.submit( handle( 1 ), constant( 0.25, 100, 2 ), tx1 );
            guard.submit( handle( 2 ), constant( 0.5, 100, 2 ), tx2 );
        }

        let mut out = [ 0.0; 8 ];
        mixer.mix( &mut out );
        assert!( out.iter().all( |s| ( s - 0.75 ).abs() < 1e-6 ) );
    }


    #[test]
    fn test_mix_clamps() {
        let mixer = Mixer::new( 1 );
        let ( tx1, _rx1 ) = oneshot::channel();
        let ( tx2, _rx2 ) = oneshot::channel();
        {
            let mut guard = mixer.lock();
            guard.submit( handle( 1 ), constant( 0.8, 10, 1 ), tx1 );
            guard.submit( handle( 2 ), constant( 0.8, 10, 1 ), tx2 );
        }

        let mut out = [ 0.0; 4 ];
        mixer.mix( &mut out );
        assert_eq!( out, [ 1.0; 4 ] );
    }


    #[test]
    fn test_mono_to_stereo() {
        let mixer = Mixer::new( 2 );
        let ( tx, _rx ) = oneshot::channel();
        mixer.lock().submit( handle( 1 ), constant( 0.3, 4, 1 ), tx );

        let mut out = [ 0.0; 8 ];
        mixer.mix( &mut out );
        assert!( out.iter().all( |s| ( s - 0.3 ).abs() < 1e-6 ) );
    }


    #[test]
    fn test_stereo_to_mono() {
        let mut out = [ 0.0; 2 ];
        accumulate( &[ 0.2, 0.4, 1.0, 0.0 ], 2, &mut out, 1 );
        assert!( ( out[ 0 ] - 0.3 ).abs() < 1e-6 );
        assert!( ( out[ 1 ] - 0.5 ).abs() < 1e-6 );
    }


    #[test]
    fn test_general_channel_map() {
        let mut out = [ 0.0; 4 ];
        accumulate( &[ 0.1, 0.2, 0.3 ], 3, &mut out, 4 );
        assert_eq!( out, [ 0.1, 0.2, 0.3, 0.3 ] );
    }


    #[test]
    fn test_completion_fires_once() {
        let mixer = Mixer::new( 1 );
        let ( tx, mut rx ) = oneshot::channel();
        mixer.lock().submit( handle( 1 ), constant( 0.1, 6, 1 ), tx );

        let mut out = [ 0.0; 4 ];
        mixer.mix( &mut out );
        assert!( rx.try_recv().is_err() );

        mixer.mix( &mut out );
        assert_eq!( &out[ ..2 ], &[ 0.1, 0.1 ] );
        assert_eq!( &out[ 2.. ], &[ 0.0, 0.0 ] );
        assert!( rx.try_recv().is_ok() );

        // Finished voices stay registered and silent
        mixer.mix( &mut out );
        assert_eq!( out, [ 0.0; 4 ] );
        let guard = mixer.lock();
        assert_eq!( guard.is_finished( handle( 1 ) ), Some( true ) );
        assert_eq!( guard.len(), 1 );
    }


    #[test]
    fn test_detach_drops_completion() {
        let mixer = Mixer::new( 2 );
        let ( tx, mut rx ) = oneshot::channel();
        mixer.lock().submit( handle( 9 ), constant( 0.1, 100, 2 ), tx );

        let mut stream = mixer.lock().detach( handle( 9 ) ).unwrap();
        stream.close();

        assert!( matches!( rx.try_recv(), Err( oneshot::error::TryRecvError::Closed ) ) );
        assert!( mixer.lock().detach( handle( 9 ) ).is_none() );
        assert!( mixer.lock().is_empty() );
    }


    #[test]
    fn test_set_gain() {
        let mixer = Mixer::new( 1 );
        let ( tx, _rx ) = oneshot::channel();
        let frames = GAIN_RAMP_FRAMES as usize * 4;
        mixer.lock().submit( handle( 1 ), constant( 1.0, frames, 1 ), tx );

        {
            let mut guard = mixer.lock();
            assert!( guard.set_gain( handle( 1 ), 0.5 ) );
            assert!( !guard.set_gain( handle( 2 ), 0.5 ) );
            assert_eq!( guard.gain( handle( 1 ) ), Some( 0.5 ) );
        }

        let mut out = vec![ 0.0; frames ];
        mixer.mix( &mut out );
        assert!( ( out[ frames - 1 ] - 0.5 ).abs() < 1e-6 );
    }
}
