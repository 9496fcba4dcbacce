//! Audio decoding via Symphonia
//!
//! Decodes an in-memory byte buffer into a fully buffered `SampleStream`.
//! Two entry points pick the container: `decode` tries each supported
//! container in a fixed order, `decode_with_hint` goes straight to the
//! container named by a file extension.

use std::io::Cursor;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    CodecType, DecoderOptions, CODEC_TYPE_MP1, CODEC_TYPE_MP2, CODEC_TYPE_MP3, CODEC_TYPE_NULL,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::stream::{ SampleStream, Seekable, StreamError };


/// How far into the buffer to look for an MPEG audio frame header.
const MPEG_SYNC_SEARCH_LEN: usize = 4096;


/// Errors that can occur during decoding.
#[derive( Debug, Error )]
pub enum DecodeError {
    #[error( "Unsupported format (tried {})", .attempted.join( ", " ) )]
    UnsupportedFormat { attempted: Vec<&'static str> },

    #[error( "Corrupt audio data (tried {}): {}", .attempted.join( ", " ), .reason )]
    Corrupt {
        attempted: Vec<&'static str>,
        reason: String,
    },

    #[error( "Unknown file extension: {0}" )]
    UnknownExtension( String ),
}


/// Supported containers.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum Container {
    Wav,
    Mp3,
}


impl Container {
    /// Order in which `decode` tries the containers.
    pub const TRIAL_ORDER: [Container; 2] = [ Container::Wav, Container::Mp3 ];


    /// Short lowercase name, also used as the format hint.
    pub fn name( self ) -> &'static str {
        match self {
            Container::Wav => "wav",
            Container::Mp3 => "mp3",
        }
    }


    /// Maps a file extension (with or without the leading dot) to a container.
    pub fn from_extension( ext: &str ) -> Option<Self> {
        let ext = ext.trim_start_matches( '.' ).to_ascii_lowercase();
        match ext.as_str() {
            "wav" | "wave" => Some( Container::Wav ),
            "mp3" => Some( Container::Mp3 ),
            _ => None,
        }
    }


    /// Cheap signature check before handing the bytes to symphonia.
    fn signature_matches( self, bytes: &[u8] ) -> bool {
        match self {
            Container::Wav => {
                bytes.len() >= 12 && &bytes[ ..4 ] == b"RIFF" && &bytes[ 8..12 ] == b"WAVE"
            }
            Container::Mp3 => {
                if bytes.starts_with( b"ID3" ) {
                    return true;
                }
                let window = &bytes[ ..bytes.len().min( MPEG_SYNC_SEARCH_LEN ) ];
                window.windows( 4 ).any( is_mpeg_frame_header )
            }
        }
    }


    /// Whether the detected codec belongs to this container.
    fn accepts_codec( self, codec: CodecType ) -> bool {
        let mpeg = codec == CODEC_TYPE_MP1 || codec == CODEC_TYPE_MP2 || codec == CODEC_TYPE_MP3;
        match self {
            Container::Wav => codec != CODEC_TYPE_NULL && !mpeg,
            Container::Mp3 => mpeg,
        }
    }
}


impl std::fmt::Display for Container {
    fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
        f.write_str( self.name() )
    }
}


/// Checks four bytes for a plausible MPEG audio frame header.
fn is_mpeg_frame_header( header: &[u8] ) -> bool {
    header[ 0 ] == 0xFF
        && header[ 1 ] & 0xE0 == 0xE0
        && header[ 1 ] & 0x06 != 0x00  // layer
        && header[ 1 ] & 0x18 != 0x08  // version
        && header[ 2 ] & 0xF0 != 0xF0  // bitrate
        && header[ 2 ] & 0x0C != 0x0C  // sample rate
}


/// Rejects a RIFF/WAVE `fmt ` chunk with no channels or a zero sample rate,
/// which symphonia cannot represent.
///
/// A missing or short `fmt ` chunk is left for symphonia to report.
fn check_wav_format( bytes: &[u8] ) -> Result<(), String> {
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[ pos..pos + 4 ];
        let size = u32::from_le_bytes( [ bytes[ pos + 4 ], bytes[ pos + 5 ], bytes[ pos + 6 ], bytes[ pos + 7 ] ] ) as usize;
        let body = pos + 8;

        if id == b"fmt " {
            if size < 16 || body + 8 > bytes.len() {
                return Ok(());
            }
            let channels = u16::from_le_bytes( [ bytes[ body + 2 ], bytes[ body + 3 ] ] );
            let rate = u32::from_le_bytes( [ bytes[ body + 4 ], bytes[ body + 5 ], bytes[ body + 6 ], bytes[ body + 7 ] ] );
            if channels == 0 {
                return Err( "fmt chunk declares 0 channels".into() );
            }
            if rate == 0 {
                return Err( "fmt chunk declares a 0 Hz sample rate".into() );
            }
            return Ok(());
        }

        // Chunks are padded to an even length
        pos = body.saturating_add( size ).saturating_add( size & 1 );
    }
    Ok(())
}


/// Format of a decoded stream.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct Format {
    pub sample_rate: u32,
    pub channels: u16,
    pub container: Container,
    /// Length in frames
    pub frames: usize,
}


/// Outcome of one container attempt.
enum Attempt {
    /// The bytes are not this container
    NotRecognized,
    /// The container matched but its contents could not be decoded
    Corrupt( String ),
}


/// Decodes `bytes`, trying each container in `Container::TRIAL_ORDER`.
pub fn decode( bytes: &[u8] ) -> Result<( SampleStream, Format ), DecodeError> {
    let data: Arc<[u8]> = Arc::from( bytes );
    let mut attempted = Vec::with_capacity( Container::TRIAL_ORDER.len() );
    let mut corrupt = None;

    for container in Container::TRIAL_ORDER {
        attempted.push( container.name() );
        match decode_as( container, &data ) {
            Ok( decoded ) => return Ok( decoded ),
            Err( Attempt::NotRecognized ) => {
                tracing::trace!( "Not a {} stream", container );
            }
            Err( Attempt::Corrupt( reason ) ) => {
                tracing::debug!( "Failed to decode as {}: {}", container, reason );
                corrupt.get_or_insert( reason );
            }
        }
    }

    Err( match corrupt {
        Some( reason ) => DecodeError::Corrupt { attempted, reason },
        None => DecodeError::UnsupportedFormat { attempted },
    })
}


/// Decodes `bytes` as the container named by `extension` only.
pub fn decode_with_hint(
    bytes: &[u8],
    extension: &str,
) -> Result<( SampleStream, Format ), DecodeError> {
    let container = Container::from_extension( extension )
        .ok_or_else( || DecodeError::UnknownExtension( extension.to_string() ) )?;

    let data: Arc<[u8]> = Arc::from( bytes );
    decode_as( container, &data ).map_err( |attempt| match attempt {
        Attempt::NotRecognized => DecodeError::UnsupportedFormat {
            attempted: vec![ container.name() ],
        },
        Attempt::Corrupt( reason ) => DecodeError::Corrupt {
            attempted: vec![ container.name() ],
            reason,
        },
    })
}


/// Detects and fully decodes `data` as `container`.
fn decode_as(
    container: Container,
    data: &Arc<[u8]>,
) -> Result<( SampleStream, Format ), Attempt> {
    if !container.signature_matches( data ) {
        return Err( Attempt::NotRecognized );
    }
    if container == Container::Wav {
        check_wav_format( data ).map_err( Attempt::Corrupt )?;
    }

    let source = Cursor::new( Arc::clone( data ) );
    let mss = MediaSourceStream::new( Box::new( source ), MediaSourceStreamOptions::default() );

    let mut hint = Hint::new();
    hint.with_extension( container.name() );

    let detected = symphonia::default::get_probe()
        .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
        .map_err( |e| Attempt::Corrupt( e.to_string() ) )?;
    let mut reader = detected.format;

    // Find the first audio track
    let track = reader
        .tracks()
        .iter()
        .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
        .ok_or_else( || Attempt::Corrupt( "no audio tracks found".into() ) )?;

    if !container.accepts_codec( track.codec_params.codec ) {
        return Err( Attempt::NotRecognized );
    }

    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make( &codec_params, &DecoderOptions::default() )
        .map_err( |e| Attempt::Corrupt( e.to_string() ) )?;

    let mut sample_rate = codec_params.sample_rate;
    let mut channels = codec_params.channels.map( |c| c.count() as u16 );
    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut error = None;

    loop {
        let packet = match reader.next_packet() {
            Ok( packet ) => packet,
            Err( SymphoniaError::IoError( ref e ) )
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err( e ) => {
                error = Some( e.to_string() );
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode( &packet ) {
            Ok( decoded ) => decoded,
            // Recoverable, skip this packet
            Err( SymphoniaError::DecodeError( _ ) ) => continue,
            Err( e ) => {
                error = Some( e.to_string() );
                break;
            }
        };

        let spec = *decoded.spec();
        let num_frames = decoded.frames();
        if num_frames == 0 {
            continue;
        }

        sample_rate = Some( spec.rate );
        channels = Some( spec.channels.count() as u16 );

        let needed = num_frames * spec.channels.count();
        if sample_buf.as_ref().map_or( true, |b| b.capacity() < needed ) {
            sample_buf = Some( SampleBuffer::new( num_frames as u64, spec ) );
        }
        if let Some( buf ) = sample_buf.as_mut() {
            buf.copy_interleaved_ref( decoded );
            samples.extend_from_slice( buf.samples() );
        }
    }

    let ( Some( sample_rate ), Some( channels ) ) = ( sample_rate, channels ) else {
        return Err( Attempt::Corrupt( "stream has no sample format".into() ) );
    };
    if samples.is_empty() || channels == 0 {
        return Err( Attempt::Corrupt(
            error.unwrap_or_else( || "no audio frames decoded".into() )
        ));
    }

    if let Some( ref e ) = error {
        tracing::warn!( "{} stream ended early: {}", container, e );
    }

    let stream = SampleStream::new( samples, channels, sample_rate )
        .with_error( error.map( StreamError::Decode ) );

    let format = Format {
        sample_rate,
        channels,
        container,
        frames: stream.len(),
    };

    tracing::debug!(
        "Decoded {}: {} Hz, {} channels, {} frames",
        container,
        format.sample_rate,
        format.channels,
        format.frames
    );

    Ok(( stream, format ))
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::stream::Streamer;


    #[test]
    fn test_decode_wav() {
        let bytes = fixtures::wav( 22050, 2, 2205 );
        let ( stream, format ) = decode( &bytes ).unwrap();

        assert_eq!( format.container, Container::Wav );
        assert_eq!( format.sample_rate, 22050 );
        assert_eq!( format.channels, 2 );
        assert_eq!( format.frames, 2205 );
        assert_eq!( stream.len(), 2205 );
        assert!( stream.err().is_none() );
    }


    #[test]
    fn test_decode_mp3_after_wav_attempt() {
        let bytes = fixtures::mp3( 20 );
        let ( stream, format ) = decode( &bytes ).unwrap();

        assert_eq!( format.container, Container::Mp3 );
        assert_eq!( format.sample_rate, 44100 );
        assert_eq!( format.channels, 1 );
        assert!( stream.len() > 0 );
    }


    #[test]
    fn test_decode_empty() {
        let err = decode( &[] ).unwrap_err();
        match err {
            DecodeError::UnsupportedFormat { attempted } => {
                assert_eq!( attempted, vec![ "wav", "mp3" ] );
            }
            other => panic!( "unexpected error: {other}" ),
        }
    }


    #[test]
    fn test_decode_random_bytes() {
        for seed in 0..32 {
            let err = decode( &fixtures::noise( 4096, seed ) ).unwrap_err();
            assert!( matches!(
                err,
                DecodeError::UnsupportedFormat { .. } | DecodeError::Corrupt { .. }
            ));
        }
    }


    #[test]
    fn test_decode_zero_rate_wav() {
        let err = decode( &fixtures::wav( 0, 1, 100 ) ).unwrap_err();
        match err {
            DecodeError::Corrupt { attempted, reason } => {
                assert_eq!( attempted[ 0 ], "wav" );
                assert!( reason.contains( "0 Hz" ) );
            }
            other => panic!( "unexpected error: {other}" ),
        }

        assert!( decode_with_hint( &fixtures::wav( 0, 2, 10 ), "wav" ).is_err() );
    }


    #[test]
    fn test_decode_zero_channel_wav() {
        let err = decode( &fixtures::wav( 44100, 0, 100 ) ).unwrap_err();
        assert!( matches!( err, DecodeError::Corrupt { .. } ) );
    }


    #[test]
    fn test_decode_truncated_wav_header() {
        let bytes = fixtures::wav( 44100, 1, 100 );
        let result = decode( &bytes[ ..20 ] );
        assert!( result.is_err() );
    }


    #[test]
    fn test_decode_header_only_wav() {
        let bytes = fixtures::wav( 44100, 1, 0 );
        let err = decode( &bytes ).unwrap_err();
        assert!( matches!( err, DecodeError::Corrupt { .. } ) );
    }


    #[test]
    fn test_hint_mode() {
        let bytes = fixtures::wav( 8000, 1, 800 );
        let ( _, format ) = decode_with_hint( &bytes, ".WAV" ).unwrap();
        assert_eq!( format.container, Container::Wav );
    }


    #[test]
    fn test_hint_mode_does_not_fall_back() {
        let bytes = fixtures::wav( 8000, 1, 800 );
        let err = decode_with_hint( &bytes, "mp3" ).unwrap_err();
        match err {
            DecodeError::UnsupportedFormat { attempted } => assert_eq!( attempted, vec![ "mp3" ] ),
            other => panic!( "unexpected error: {other}" ),
        }
    }


    #[test]
    fn test_hint_mode_unknown_extension() {
        let bytes = fixtures::wav( 8000, 1, 800 );
        let err = decode_with_hint( &bytes, "flac" ).unwrap_err();
        assert!( matches!( err, DecodeError::UnknownExtension( ext ) if ext == "flac" ) );
    }


    #[test]
    fn test_container_from_extension() {
        assert_eq!( Container::from_extension( "wave" ), Some( Container::Wav ) );
        assert_eq!( Container::from_extension( "Mp3" ), Some( Container::Mp3 ) );
        assert_eq!( Container::from_extension( "ogg" ), None );
    }


    #[test]
    fn test_mpeg_header_check() {
        assert!( is_mpeg_frame_header( &[ 0xFF, 0xFB, 0x90, 0xC4 ] ) );
        // Reserved layer
        assert!( !is_mpeg_frame_header( &[ 0xFF, 0xF9, 0x90, 0xC4 ] ) );
        // Bad bitrate
        assert!( !is_mpeg_frame_header( &[ 0xFF, 0xFB, 0xF0, 0xC4 ] ) );
    }
}
