//! Handle table
//!
//! Registry of live playback sessions keyed by the handle returned to
//! callers. Removal is the single arbitration point between the paths that
//! can tear a session down: whoever removes a handle first owns its teardown.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use parking_lot::RwLock;
use thiserror::Error;


/// Errors returned by handle lookups.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Error )]
pub enum HandleError {
    #[error( "No live session for handle {0}" )]
    NotFound( PlaybackHandle ),
}


/// Identifies one playing sound.
///
/// Handles are allocated from a counter that starts at 1 and is never
/// reset, so a handle is never reused within a table's lifetime.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct PlaybackHandle( u64 );


impl PlaybackHandle {
    /// Wraps a raw value. Zero is not a valid handle.
    pub fn from_raw( raw: u64 ) -> Option<Self> {
        ( raw != 0 ).then_some( Self( raw ) )
    }


    pub fn get( self ) -> u64 {
        self.0
    }
}


impl fmt::Display for PlaybackHandle {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        write!( f, "#{}", self.0 )
    }
}


/// Where a handle is in its lifecycle, as seen by queries.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum SessionState {
    /// Registered and being mixed
    Playing,
    /// Stopped by a caller, fade-out in progress
    Stopping,
}


/// Bookkeeping for one live sound. The samples themselves live in the
/// mixer voice registered under the same handle.
#[derive( Debug, Clone )]
pub struct PlaybackSession {
    /// Resource key, file path, or `<bytes>`
    pub source: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub looping: bool,
    pub started: Instant,
}


impl PlaybackSession {
    pub fn new( source: impl Into<String>, sample_rate: u32, channels: u16, looping: bool ) -> Self {
        Self {
            source: source.into(),
            sample_rate,
            channels,
            looping,
            started: Instant::now(),
        }
    }
}


struct TableState {
    next: u64,
    sessions: HashMap<PlaybackHandle, PlaybackSession>,
}


/// Concurrency-safe map from handles to sessions.
pub struct HandleTable {
    state: RwLock<TableState>,
}


impl HandleTable {
    pub fn new() -> Self {
        Self {
            state: RwLock::new( TableState {
                next: 1,
                sessions: HashMap::new(),
            }),
        }
    }


    /// Registers a session under a freshly allocated handle.
    pub fn insert( &self, session: PlaybackSession ) -> PlaybackHandle {
        let mut state = self.state.write();
        let handle = PlaybackHandle( state.next );
        state.next += 1;
        state.sessions.insert( handle, session );
        handle
    }


    pub fn get( &self, handle: PlaybackHandle ) -> Result<PlaybackSession, HandleError> {
        self.state
            .read()
            .sessions
            .get( &handle )
            .cloned()
            .ok_or( HandleError::NotFound( handle ) )
    }


    /// Removes a session. Of several concurrent removers only one succeeds.
    pub fn remove( &self, handle: PlaybackHandle ) -> Result<PlaybackSession, HandleError> {
        self.state
            .write()
            .sessions
            .remove( &handle )
            .ok_or( HandleError::NotFound( handle ) )
    }


    pub fn contains( &self, handle: PlaybackHandle ) -> bool {
        self.state.read().sessions.contains_key( &handle )
    }


    /// Handles live at the time of the call, in allocation order.
    ///
    /// Any of them may be gone by the time the caller acts on it.
    pub fn snapshot_handles( &self ) -> Vec<PlaybackHandle> {
        let mut handles: Vec<PlaybackHandle> = self.state.read().sessions.keys().copied().collect();
        handles.sort_unstable();
        handles
    }


    pub fn len( &self ) -> usize {
        self.state.read().sessions.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.state.read().sessions.is_empty()
    }
}


impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg( test )]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;


    fn session() -> PlaybackSession {
        PlaybackSession::new( "test", 44100, 2, false )
    }


    #[test]
    fn test_handles_start_at_one() {
        let table = HandleTable::new();
        assert_eq!( table.insert( session() ).get(), 1 );
        assert_eq!( table.insert( session() ).get(), 2 );
    }


    #[test]
    fn test_handles_not_reused_after_empty() {
        let table = HandleTable::new();
        let first = table.insert( session() );
        table.remove( first ).unwrap();
        assert!( table.is_empty() );

        let second = table.insert( session() );
        assert_ne!( first, second );
        assert!( second > first );
    }


    #[test]
    fn test_remove_twice() {
        let table = HandleTable::new();
        let handle = table.insert( session() );

        assert!( table.remove( handle ).is_ok() );
        assert_eq!( table.remove( handle ).unwrap_err(), HandleError::NotFound( handle ) );
        assert!( table.get( handle ).is_err() );
    }


    #[test]
    fn test_concurrent_removers_one_wins() {
        for _ in 0..50 {
            let table = Arc::new( HandleTable::new() );
            let handle = table.insert( session() );

            let winners: usize = ( 0..8 )
                .map( |_| {
                    let table = Arc::clone( &table );
                    thread::spawn( move || table.remove( handle ).is_ok() )
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map( |t| t.join().unwrap() as usize )
                .sum();

            assert_eq!( winners, 1 );
        }
    }


    #[test]
    fn test_concurrent_inserts_unique() {
        let table = Arc::new( HandleTable::new() );
        let threads: Vec<_> = ( 0..8 )
            .map( |_| {
                let table = Arc::clone( &table );
                thread::spawn( move || {
                    ( 0..100 ).map( |_| table.insert( session() ) ).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<PlaybackHandle> = threads.into_iter().flat_map( |t| t.join().unwrap() ).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!( all.len(), 800 );
        assert_eq!( table.len(), 800 );
    }


    #[test]
    fn test_snapshot_sorted() {
        let table = HandleTable::new();
        let handles: Vec<_> = ( 0..5 ).map( |_| table.insert( session() ) ).collect();
        table.remove( handles[ 2 ] ).unwrap();

        assert_eq!(
            table.snapshot_handles(),
            vec![ handles[ 0 ], handles[ 1 ], handles[ 3 ], handles[ 4 ] ]
        );
    }


    #[test]
    fn test_from_raw() {
        assert!( PlaybackHandle::from_raw( 0 ).is_none() );
        assert_eq!( PlaybackHandle::from_raw( 7 ).map( PlaybackHandle::get ), Some( 7 ) );
        assert_eq!( PlaybackHandle::from_raw( 3 ).unwrap().to_string(), "#3" );
    }
}
