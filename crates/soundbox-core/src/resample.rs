//! Sample rate conversion via rubato
//!
//! Streams are fully buffered, so conversion happens once when playback
//! starts rather than in the mixing loop.

use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use thiserror::Error;

use crate::stream::{ SampleStream, Streamer };


/// Output chunk size handed to the resampler.
const CHUNK_FRAMES: usize = 1024;


/// Errors that can occur during resampling.
#[derive( Debug, Error )]
pub enum ResampleError {
    #[error( "Failed to create resampler: {0}" )]
    Create( String ),

    #[error( "Resample error: {0}" )]
    Process( String ),
}


/// Converts planar samples back to interleaved format.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>], out: &mut Vec<f32> ) {
    if channels.is_empty() {
        return;
    }
    let frames = channels[ 0 ].len();
    out.reserve( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
}


/// Splits interleaved samples into one buffer per channel.
fn deinterleave( samples: &[f32], channels: usize ) -> Vec<Vec<f32>> {
    let mut planar: Vec<Vec<f32>> = ( 0..channels )
        .map( |_| Vec::with_capacity( samples.len() / channels ) )
        .collect();
    for frame in samples.chunks_exact( channels ) {
        for ( ch_idx, sample ) in frame.iter().enumerate() {
            planar[ ch_idx ].push( *sample );
        }
    }
    planar
}


/// Converts interleaved `samples` from `from_rate` to `to_rate`.
pub fn resample(
    samples: &[f32],
    channels: u16,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, ResampleError> {
    let channels = channels.max( 1 ) as usize;
    if from_rate == to_rate || samples.is_empty() {
        return Ok( samples.to_vec() );
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = FastFixedOut::<f32>::new(
        ratio,
        1.0,  // fixed ratio, no runtime adjustment
        PolynomialDegree::Cubic,
        CHUNK_FRAMES,
        channels,
    ).map_err( |e| ResampleError::Create( e.to_string() ) )?;

    let input = deinterleave( samples, channels );
    let total_frames = input[ 0 ].len();
    let expected_frames = ( total_frames as f64 * ratio ).round() as usize;
    let mut output = Vec::with_capacity( ( expected_frames + CHUNK_FRAMES ) * channels );

    let mut offset = 0;
    while total_frames - offset >= resampler.input_frames_next() {
        let needed = resampler.input_frames_next();
        let chunk: Vec<&[f32]> = input
            .iter()
            .map( |ch| &ch[ offset..offset + needed ] )
            .collect();

        let resampled = resampler
            .process( &chunk, None )
            .map_err( |e| ResampleError::Process( e.to_string() ) )?;
        interleave( &resampled, &mut output );
        offset += needed;
    }

    // Flush the tail, if the chunks did not use up the input exactly
    if offset < total_frames {
        let tail: Vec<&[f32]> = input.iter().map( |ch| &ch[ offset.. ] ).collect();
        let resampled = resampler
            .process_partial( Some( tail.as_slice() ), None )
            .map_err( |e| ResampleError::Process( e.to_string() ) )?;
        interleave( &resampled, &mut output );
    }

    // Push zeros until the resampler's delay is drained

    let delay = resampler.output_delay();
    while output.len() / channels < expected_frames + delay {
        let resampled = resampler
            .process_partial::<&[f32]>( None, None )
            .map_err( |e| ResampleError::Process( e.to_string() ) )?;
        if resampled[ 0 ].is_empty() {
            break;
        }
        interleave( &resampled, &mut output );
    }

    // Drop the leading delay and trim to the expected length
    let start = ( delay * channels ).min( output.len() );
    let mut output = output.split_off( start );
    output.truncate( expected_frames * channels );

    Ok( output )
}


/// Resamples a decoded stream to `to_rate`, keeping its error side channel.
pub fn resample_stream( stream: SampleStream, to_rate: u32 ) -> Result<SampleStream, ResampleError> {
    let from_rate = stream.sample_rate();
    if from_rate == to_rate {
        return Ok( stream );
    }

    let channels = stream.channels();
    tracing::info!( "Resampling: {} Hz → {} Hz", from_rate, to_rate );

    let ( samples, error ) = stream.into_parts();
    let converted = resample( &samples, channels, from_rate, to_rate )?;
    Ok( SampleStream::new( converted, channels, to_rate ).with_error( error ) )
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::stream::Seekable;


    fn sine( frames: usize, channels: u16, rate: u32 ) -> Vec<f32> {
        ( 0..frames )
            .flat_map( |i| {
                let v = ( i as f32 * 440.0 * std::f32::consts::TAU / rate as f32 ).sin() * 0.5;
                std::iter::repeat( v ).take( channels as usize )
            })
            .collect()
    }


    #[test]
    fn test_same_rate_is_identity() {
        let samples = sine( 100, 2, 44100 );
        let out = resample( &samples, 2, 44100, 44100 ).unwrap();
        assert_eq!( out, samples );
    }


    #[test]
    fn test_upsample_length() {
        let samples = sine( 22050, 1, 22050 );
        let out = resample( &samples, 1, 22050, 44100 ).unwrap();
        assert_eq!( out.len(), 44100 );
    }


    #[test]
    fn test_downsample_stereo_length() {
        let samples = sine( 48000, 2, 48000 );
        let out = resample( &samples, 2, 48000, 44100 ).unwrap();
        assert_eq!( out.len(), 44100 * 2 );
        assert!( out.iter().all( |s| s.abs() <= 1.0 ) );
    }


    #[test]
    fn test_input_consumed_by_whole_chunks() {
        for ( from, to ) in [ ( 22050, 44100 ), ( 11025, 22050 ), ( 48000, 44100 ), ( 44100, 48000 ) ] {
            let ratio = to as f64 / from as f64;
            let chunk = FastFixedOut::<f32>::new( ratio, 1.0, PolynomialDegree::Cubic, CHUNK_FRAMES, 1 )
                .unwrap()
                .input_frames_next();

            for frames in [ chunk, chunk * 2, chunk * 3, chunk - 1, chunk + 1 ] {
                let out = resample( &vec![ 0.1; frames ], 1, from, to )
                    .unwrap_or_else( |e| panic!( "{} -> {} Hz, {} frames: {}", from, to, frames, e ) );
                assert_eq!( out.len(), ( frames as f64 * ratio ).round() as usize );
            }
        }
    }


    #[test]
    fn test_length_sweep() {
        for frames in 1..1200 {
            let out = resample( &vec![ 0.1; frames ], 1, 22050, 44100 ).unwrap();
            assert_eq!( out.len(), frames * 2 );
        }
    }


    #[test]
    fn test_resample_stream() {
        let stream = SampleStream::new( sine( 8000, 1, 8000 ), 1, 8000 );
        let out = resample_stream( stream, 16000 ).unwrap();
        assert_eq!( out.sample_rate(), 16000 );
        assert_eq!( out.channels(), 1 );
        assert_eq!( out.len(), 16000 );
    }
}
