//! Soundbox C ABI
//!
//! Exposes a process-wide `Player` rooted at the current directory. It is
//! built on first use and lives until the process exits.
//!
//! Play calls return a positive handle, or a sentinel `<= 0` on failure:
//!
//! | Code | Meaning |
//! |---|---|
//! | `0` | invalid argument (null pointer, key not UTF-8) |
//! | `-1` | resource not found |
//! | `-2` | resource read failed |
//! | `-3` | resource data corrupt |
//! | `-4` | audio could not be decoded |
//! | `-5` | output device failed |
//! | `-6` | internal failure |

use std::ffi::{ c_char, CStr };
use std::mem::size_of;
use std::panic::{ self, AssertUnwindSafe };
use std::sync::{ Arc, OnceLock };
use std::{ ptr, slice };

use soundbox_core::{ CpalDevice, PlayError, PlaybackHandle, Player, PlayerConfig, ResourceStore };


/// Returned for null pointers and undecodable keys.
const INVALID_ARGUMENT: i64 = 0;

/// Returned when a handle does not fit the C return type, or playback panicked.
const INTERNAL_ERROR: i64 = -6;

/// Bytes in front of every exported buffer holding its length.
const LEN_HEADER: usize = size_of::<usize>();


static PLAYER: OnceLock<Player> = OnceLock::new();


fn player() -> &'static Player {
    PLAYER.get_or_init( || {
        Player::new(
            Arc::new( CpalDevice::new() ),
            ResourceStore::load( "." ),
            PlayerConfig::default(),
        )
    })
}


/// Borrows a NUL-terminated UTF-8 key.
///
/// # Safety
///
/// `key` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn key_arg<'a>( key: *const c_char ) -> Option<&'a str> {
    if key.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr( key ) }.to_str().ok()
}


/// Borrows a caller-owned byte buffer.
///
/// # Safety
///
/// `buf` must be null or valid for reads of `len` bytes for `'a`.
unsafe fn bytes_arg<'a>( buf: *const u8, len: usize ) -> Option<&'a [u8]> {
    if buf.is_null() {
        return None;
    }
    Some( unsafe { slice::from_raw_parts( buf, len ) } )
}


/// Runs a play call, mapping its outcome to a handle or sentinel.
///
/// Panics must not unwind into the host, so they become `INTERNAL_ERROR`.
fn handle_code( what: &str, play: impl FnOnce() -> Result<PlaybackHandle, PlayError> ) -> i64 {
    match panic::catch_unwind( AssertUnwindSafe( play ) ) {
        Ok( Ok( handle ) ) => i64::try_from( handle.get() ).unwrap_or( INTERNAL_ERROR ),
        Ok( Err( e ) ) => {
            tracing::warn!( "{} failed: {}", what, e );
            e.code()
        }
        Err( _ ) => {
            tracing::error!( "{} panicked", what );
            INTERNAL_ERROR
        }
    }
}


/// Plays the resource stored under `key` once.
///
/// # Safety
///
/// `key` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn soundbox_play( key: *const c_char ) -> i64 {
    match unsafe { key_arg( key ) } {
        Some( key ) => handle_code( key, || player().play_key( key ) ),
        None => INVALID_ARGUMENT,
    }
}


/// Plays an encoded WAV or MP3 buffer once. The buffer is copied.
///
/// # Safety
///
/// `buf` must be null or valid for reads of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn soundbox_play_bytes( buf: *const u8, len: usize ) -> i64 {
    match unsafe { bytes_arg( buf, len ) } {
        Some( bytes ) => handle_code( "play bytes", || player().play_bytes( bytes ) ),
        None => INVALID_ARGUMENT,
    }
}


/// Plays the resource stored under `key` until stopped.
///
/// # Safety
///
/// `key` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn soundbox_play_loop( key: *const c_char ) -> i64 {
    match unsafe { key_arg( key ) } {
        Some( key ) => handle_code( key, || player().play_key_looped( key ) ),
        None => INVALID_ARGUMENT,
    }
}


/// Plays an encoded WAV or MP3 buffer until stopped. The buffer is copied.
///
/// # Safety
///
/// `buf` must be null or valid for reads of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn soundbox_play_loop_bytes( buf: *const u8, len: usize ) -> i64 {
    match unsafe { bytes_arg( buf, len ) } {
        Some( bytes ) => handle_code( "play looped bytes", || player().play_bytes_looped( bytes ) ),
        None => INVALID_ARGUMENT,
    }
}


/// Fades out and releases a playing sound. Unknown handles are ignored.
#[no_mangle]
pub extern "C" fn soundbox_stop( handle: i64 ) {
    let handle = u64::try_from( handle ).ok().and_then( PlaybackHandle::from_raw );
    if let Some( handle ) = handle {
        // The fade finishes in the background
        let _ = player().stop( handle );
    }
}


/// Fades out and releases every playing sound.
#[no_mangle]
pub extern "C" fn soundbox_stop_all() {
    let _ = player().stop_all();
}


/// Hands a byte vector to the caller, writing its length to `out_len`.
///
/// The length is also stored in a header just before the returned pointer,
/// so `soundbox_release_buffer` needs only the pointer.
///
/// # Safety
///
/// `out_len` must be valid for writes.
unsafe fn into_raw_buffer( data: Vec<u8>, out_len: *mut usize ) -> *mut u8 {
    let len = data.len();
    let mut block = Vec::with_capacity( LEN_HEADER + len );
    block.extend_from_slice( &len.to_ne_bytes() );
    block.extend_from_slice( &data );

    unsafe { *out_len = len };
    let base = Box::into_raw( block.into_boxed_slice() ) as *mut u8;
    unsafe { base.add( LEN_HEADER ) }
}


/// Returns the decompressed bytes of the resource stored under `key`.
///
/// On success the length is written to `out_len` and the buffer must be
/// returned with `soundbox_release_buffer`. On failure returns null and
/// writes 0.
///
/// # Safety
///
/// `key` must be null or a valid NUL-terminated string; `out_len` must be
/// null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn soundbox_get_resource( key: *const c_char, out_len: *mut usize ) -> *mut u8 {
    if out_len.is_null() {
        return ptr::null_mut();
    }
    unsafe { *out_len = 0 };

    let Some( key ) = ( unsafe { key_arg( key ) } ) else {
        return ptr::null_mut();
    };

    match player().resources().resolve( key ) {
        Ok( data ) => unsafe { into_raw_buffer( data, out_len ) },
        Err( e ) => {
            tracing::warn!( "Resource export failed: {}", e );
            ptr::null_mut()
        }
    }
}


/// Frees a buffer returned by `soundbox_get_resource`. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by `soundbox_get_resource` that
/// has not been released yet.
#[no_mangle]
pub unsafe extern "C" fn soundbox_release_buffer( ptr: *mut u8 ) {
    if ptr.is_null() {
        return;
    }

    let base = unsafe { ptr.sub( LEN_HEADER ) };
    let mut header = [ 0u8; LEN_HEADER ];
    unsafe { ptr::copy_nonoverlapping( base, header.as_mut_ptr(), LEN_HEADER ) };
    let len = usize::from_ne_bytes( header );

    drop( unsafe { Box::from_raw( ptr::slice_from_raw_parts_mut( base, LEN_HEADER + len ) ) } );
}


#[cfg( test )]
mod tests {
    use std::ffi::CString;

    use super::*;


    #[test]
    fn test_null_arguments() {
        unsafe {
            assert_eq!( soundbox_play( ptr::null() ), INVALID_ARGUMENT );
            assert_eq!( soundbox_play_loop( ptr::null() ), INVALID_ARGUMENT );
            assert_eq!( soundbox_play_bytes( ptr::null(), 16 ), INVALID_ARGUMENT );
            assert_eq!( soundbox_play_loop_bytes( ptr::null(), 16 ), INVALID_ARGUMENT );
        }
    }


    #[test]
    fn test_non_utf8_key() {
        let key = CString::new( vec![ 0xFF, 0xFE ] ).unwrap();
        unsafe {
            assert_eq!( soundbox_play( key.as_ptr() ), INVALID_ARGUMENT );
        }
    }


    #[test]
    fn test_missing_key_is_not_found() {
        let key = CString::new( "no-such-resource" ).unwrap();
        unsafe {
            assert_eq!( soundbox_play( key.as_ptr() ), -1 );
            assert_eq!( soundbox_play_loop( key.as_ptr() ), -1 );
        }
    }


    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let junk = [ 0u8; 64 ];
        unsafe {
            assert_eq!( soundbox_play_bytes( junk.as_ptr(), junk.len() ), -4 );
        }
    }


    #[test]
    fn test_stop_unknown_is_noop() {
        soundbox_stop( 0 );
        soundbox_stop( -3 );
        soundbox_stop( 123_456 );
        soundbox_stop_all();
    }


    #[test]
    fn test_get_resource_failures() {
        let key = CString::new( "no-such-resource" ).unwrap();
        let mut len = 99;
        unsafe {
            assert!( soundbox_get_resource( key.as_ptr(), ptr::null_mut() ).is_null() );
            assert!( soundbox_get_resource( ptr::null(), &mut len ).is_null() );
            assert_eq!( len, 0 );

            len = 99;
            assert!( soundbox_get_resource( key.as_ptr(), &mut len ).is_null() );
            assert_eq!( len, 0 );
        }
    }


    #[test]
    fn test_release_buffer() {
        let mut len = 0;
        unsafe {
            soundbox_release_buffer( ptr::null_mut() );

            let buf = into_raw_buffer( vec![ 1, 2, 3, 4 ], &mut len );
            assert_eq!( len, 4 );
            assert_eq!( slice::from_raw_parts( buf, len ), &[ 1, 2, 3, 4 ] );
            soundbox_release_buffer( buf );

            let empty = into_raw_buffer( Vec::new(), &mut len );
            assert_eq!( len, 0 );
            assert!( !empty.is_null() );
            soundbox_release_buffer( empty );

            let large: Vec<u8> = ( 0..100_000u32 ).map( |i| i as u8 ).collect();
            let buf = into_raw_buffer( large.clone(), &mut len );
            assert_eq!( slice::from_raw_parts( buf, len ), large.as_slice() );
            soundbox_release_buffer( buf );
        }
    }


    #[test]
    fn test_panic_becomes_sentinel() {
        let code = handle_code( "boom", || panic!( "decoder blew up" ) );
        assert_eq!( code, INTERNAL_ERROR );
    }


    #[test]
    fn test_zero_rate_wav_is_decode_failure() {
        // RIFF/WAVE header declaring mono at 0 Hz, followed by two samples
        let mut wav = Vec::new();
        wav.extend_from_slice( b"RIFF" );
        wav.extend_from_slice( &40u32.to_le_bytes() );
        wav.extend_from_slice( b"WAVEfmt " );
        wav.extend_from_slice( &16u32.to_le_bytes() );
        wav.extend_from_slice( &1u16.to_le_bytes() );
        wav.extend_from_slice( &1u16.to_le_bytes() );
        wav.extend_from_slice( &0u32.to_le_bytes() );
        wav.extend_from_slice( &0u32.to_le_bytes() );
        wav.extend_from_slice( &2u16.to_le_bytes() );
        wav.extend_from_slice( &16u16.to_le_bytes() );
        wav.extend_from_slice( b"data" );
        wav.extend_from_slice( &4u32.to_le_bytes() );
        wav.extend_from_slice( &[ 0, 1, 0, 1 ] );

        unsafe {
            assert_eq!( soundbox_play_bytes( wav.as_ptr(), wav.len() ), -4 );
        }
    }
}
