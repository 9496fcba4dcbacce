//! In-memory audio fixtures for tests.

/// Length of a 128 kbps, 44.1 kHz MPEG-1 Layer III frame without padding.
const MP3_FRAME_LEN: usize = 417;


/// Builds a 16-bit PCM WAV file holding a quiet sawtooth.
pub fn wav( sample_rate: u32, channels: u16, frames: usize ) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = ( frames * block_align as usize ) as u32;

    let mut out = Vec::with_capacity( 44 + data_len as usize );
    out.extend_from_slice( b"RIFF" );
    out.extend_from_slice( &( 36 + data_len ).to_le_bytes() );
    out.extend_from_slice( b"WAVE" );

    out.extend_from_slice( b"fmt " );
    out.extend_from_slice( &16u32.to_le_bytes() );
    out.extend_from_slice( &1u16.to_le_bytes() );
    out.extend_from_slice( &channels.to_le_bytes() );
    out.extend_from_slice( &sample_rate.to_le_bytes() );
    out.extend_from_slice( &( sample_rate * block_align as u32 ).to_le_bytes() );
    out.extend_from_slice( &block_align.to_le_bytes() );
    out.extend_from_slice( &16u16.to_le_bytes() );

    out.extend_from_slice( b"data" );
    out.extend_from_slice( &data_len.to_le_bytes() );
    for frame in 0..frames {
        let value = ( ( frame % 100 ) as i16 - 50 ) * 100;
        for _ in 0..channels {
            out.extend_from_slice( &value.to_le_bytes() );
        }
    }

    out
}


/// Builds `frames` silent mono MPEG-1 Layer III frames (128 kbps, 44.1 kHz).
pub fn mp3( frames: usize ) -> Vec<u8> {
    let mut out = Vec::with_capacity( frames * MP3_FRAME_LEN );
    for _ in 0..frames {
        out.extend_from_slice( &[ 0xFF, 0xFB, 0x90, 0xC4 ] );
        out.resize( out.len() + MP3_FRAME_LEN - 4, 0 );
    }
    out
}


/// Deterministic junk bytes covering the full byte range, so MPEG sync
/// bytes can turn up anywhere.
pub fn noise( len: usize, seed: u32 ) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678 ^ seed.wrapping_mul( 0x9E37_79B9 );
    ( 0..len )
        .map( |_| {
            state = state.wrapping_mul( 1_664_525 ).wrapping_add( 1_013_904_223 );
            ( state >> 24 ) as u8
        })
        .collect()
}
