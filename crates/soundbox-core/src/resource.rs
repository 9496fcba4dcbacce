//! Packed resource store
//!
//! Resources live in numbered shard files under `datas/`. A manifest maps
//! each key to a `[length, offset, shard]` triple locating its compressed
//! bytes. The manifest is stored with every byte complemented, and each
//! stored zstd frame has its first two magic bytes overwritten; both are
//! undone on read.

use std::collections::HashMap;
use std::fs::{ self, File };
use std::io::{ Read, Seek, SeekFrom };
use std::path::{ Path, PathBuf };

use serde::Deserialize;
use thiserror::Error;


/// Manifest location relative to the store root.
pub const MANIFEST_PATH: &str = "datas/data.dat";

/// Leading bytes of every zstd frame, clobbered in storage.
const ZSTD_MAGIC_PREFIX: [u8; 2] = [ 0x28, 0xB5 ];


/// Errors that can occur when resolving a resource.
#[derive( Debug, Error )]
pub enum ResourceError {
    #[error( "Resource not found: {0}" )]
    NotFound( String ),

    #[error( "Failed to read {path:?}: {source}" )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error( "Corrupt resource data for {key}: {reason}" )]
    CorruptData { key: String, reason: String },
}


/// Location of one resource's compressed bytes.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct IndexEntry {
    pub length: u64,
    pub offset: u64,
    pub shard: u32,
}


/// Wire shape of a manifest entry: `[length, offset, shard]`.
#[derive( Deserialize )]
struct RawEntry( u64, u64, u32 );


impl From<RawEntry> for IndexEntry {
    fn from( raw: RawEntry ) -> Self {
        Self {
            length: raw.0,
            offset: raw.1,
            shard: raw.2,
        }
    }
}


/// Path of shard `shard` relative to the store root.
pub fn shard_path( shard: u32 ) -> String {
    format!( "datas/data{}.dat", shard )
}


/// Complements every byte. The manifest transform is its own inverse.
pub fn invert( bytes: &mut [u8] ) {
    for b in bytes.iter_mut() {
        *b = !*b;
    }
}


/// Parses a byte-inverted manifest.
pub fn parse_manifest( mut bytes: Vec<u8> ) -> Result<HashMap<String, IndexEntry>, serde_json::Error> {
    invert( &mut bytes );
    let raw: HashMap<String, RawEntry> = serde_json::from_slice( &bytes )?;
    Ok( raw.into_iter().map( |( key, entry )| ( key, entry.into() ) ).collect() )
}


/// Read-only index over a directory of shards.
#[derive( Debug, Default )]
pub struct ResourceStore {
    root: PathBuf,
    index: HashMap<String, IndexEntry>,
}


impl ResourceStore {
    /// Loads the manifest under `root`.
    ///
    /// A missing or unparsable manifest leaves the index empty; every lookup
    /// then fails with `NotFound`.
    pub fn load( root: impl Into<PathBuf> ) -> Self {
        let root = root.into();
        let manifest = root.join( MANIFEST_PATH );

        let index = match fs::read( &manifest ) {
            Ok( bytes ) => match parse_manifest( bytes ) {
                Ok( index ) => {
                    tracing::info!( "Loaded {} resources from {:?}", index.len(), manifest );
                    index
                }
                Err( e ) => {
                    tracing::warn!( "Failed to parse manifest {:?}: {}", manifest, e );
                    HashMap::new()
                }
            },
            Err( e ) => {
                tracing::warn!( "Failed to read manifest {:?}: {}", manifest, e );
                HashMap::new()
            }
        };

        Self { root, index }
    }


    /// Creates a store over an already built index.
    pub fn with_index( root: impl Into<PathBuf>, index: HashMap<String, IndexEntry> ) -> Self {
        Self { root: root.into(), index }
    }


    /// Creates a store that resolves nothing.
    pub fn empty() -> Self {
        Self::default()
    }


    pub fn root( &self ) -> &Path {
        &self.root
    }


    pub fn len( &self ) -> usize {
        self.index.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.index.is_empty()
    }


    pub fn contains( &self, key: &str ) -> bool {
        self.index.contains_key( key )
    }


    pub fn entry( &self, key: &str ) -> Option<IndexEntry> {
        self.index.get( key ).copied()
    }


    /// All keys, sorted.
    pub fn keys( &self ) -> Vec<&str> {
        let mut keys: Vec<&str> = self.index.keys().map( String::as_str ).collect();
        keys.sort_unstable();
        keys
    }


    /// Reads and decompresses the resource stored under `key`.
    pub fn resolve( &self, key: &str ) -> Result<Vec<u8>, ResourceError> {
        let entry = self.entry( key )
            .ok_or_else( || ResourceError::NotFound( key.to_string() ) )?;

        let path = self.root.join( shard_path( entry.shard ) );
        let mut packed = read_range( &path, entry.offset, entry.length )
            .map_err( |source| ResourceError::Io { path: path.clone(), source } )?;

        let corrupt = |reason: String| ResourceError::CorruptData { key: key.to_string(), reason };

        if packed.len() < ZSTD_MAGIC_PREFIX.len() {
            return Err( corrupt( format!( "{} byte frame is too short", packed.len() ) ) );
        }
        packed[ ..ZSTD_MAGIC_PREFIX.len() ].copy_from_slice( &ZSTD_MAGIC_PREFIX );

        let mut decoder = zstd::stream::read::Decoder::new( packed.as_slice() )
            .map_err( |e| corrupt( e.to_string() ) )?;
        let mut data = Vec::new();
        decoder.read_to_end( &mut data ).map_err( |e| corrupt( e.to_string() ) )?;

        tracing::debug!(
            "Resolved {}: shard {}, {} → {} bytes",
            key,
            entry.shard,
            entry.length,
            data.len()
        );

        Ok( data )
    }
}


/// Reads exactly `length` bytes at `offset`.
///
/// The buffer grows with what the file actually holds, so a manifest
/// claiming more than the shard contains fails with `UnexpectedEof`
/// instead of allocating the claimed size up front.
fn read_range( path: &Path, offset: u64, length: u64 ) -> std::io::Result<Vec<u8>> {
    let mut file = File::open( path )?;
    file.seek( SeekFrom::Start( offset ) )?;

    let mut buf = Vec::new();
    file.take( length ).read_to_end( &mut buf )?;
    if ( buf.len() as u64 ) < length {
        return Err( std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!( "expected {} bytes at offset {}, found {}", length, offset, buf.len() ),
        ));
    }
    Ok( buf )
}


#[cfg( test )]
pub( crate ) mod tests {
    use std::io::Write;

    use super::*;


    /// Builds a store on disk. Each resource is `(key, shard, payload)`.
    pub fn write_store( root: &Path, resources: &[( &str, u32, &[u8] )] ) {
        fs::create_dir_all( root.join( "datas" ) ).unwrap();

        let mut shards: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut manifest = serde_json::Map::new();

        for ( key, shard, payload ) in resources {
            let mut frame = zstd::encode_all( *payload, 3 ).unwrap();
            // Storage clobbers the magic prefix
            frame[ 0 ] = 0;
            frame[ 1 ] = 0;

            let data = shards.entry( *shard ).or_default();
            let offset = data.len();
            data.extend_from_slice( &frame );
            manifest.insert(
                key.to_string(),
                serde_json::json!( [ frame.len(), offset, shard ] ),
            );
        }

        for ( shard, data ) in shards {
            fs::write( root.join( shard_path( shard ) ), data ).unwrap();
        }

        let mut bytes = serde_json::to_vec( &manifest ).unwrap();
        invert( &mut bytes );
        File::create( root.join( MANIFEST_PATH ) ).unwrap().write_all( &bytes ).unwrap();
    }


    #[test]
    fn test_resolve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = vec![ 7u8; 10_000 ];
        let second: Vec<u8> = ( 0..5000u32 ).map( |i| ( i % 251 ) as u8 ).collect();
        write_store( dir.path(), &[
            ( "first", 0, first.as_slice() ),
            ( "second", 0, second.as_slice() ),
            ( "third", 2, &b"tiny"[ .. ] ),
        ]);

        let store = ResourceStore::load( dir.path() );
        assert_eq!( store.len(), 3 );
        assert_eq!( store.keys(), vec![ "first", "second", "third" ] );

        let data = store.resolve( "second" ).unwrap();
        assert_eq!( data.len(), second.len() );
        assert_eq!( data, second );
        assert_eq!( store.resolve( "first" ).unwrap(), first );
        assert_eq!( store.resolve( "third" ).unwrap(), b"tiny" );
    }


    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceStore::load( dir.path() );

        assert!( store.is_empty() );
        assert!( matches!( store.resolve( "anything" ), Err( ResourceError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_unparsable_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all( dir.path().join( "datas" ) ).unwrap();
        // Not inverted, so it parses as garbage
        fs::write( dir.path().join( MANIFEST_PATH ), br#"{"a":[1,2,3]}"# ).unwrap();

        assert!( ResourceStore::load( dir.path() ).is_empty() );
    }


    #[test]
    fn test_negative_triple_rejected() {
        let mut bytes = br#"{"a":[-1,0,0]}"#.to_vec();
        invert( &mut bytes );
        assert!( parse_manifest( bytes ).is_err() );
    }


    #[test]
    fn test_parse_manifest() {
        let mut bytes = br#"{"beep":[120,64,3]}"#.to_vec();
        invert( &mut bytes );

        let index = parse_manifest( bytes ).unwrap();
        assert_eq!( index[ "beep" ], IndexEntry { length: 120, offset: 64, shard: 3 } );
    }


    #[test]
    fn test_missing_shard_is_io() {
        let mut index = HashMap::new();
        index.insert( "gone".to_string(), IndexEntry { length: 10, offset: 0, shard: 9 } );
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceStore::with_index( dir.path(), index );

        assert!( matches!( store.resolve( "gone" ), Err( ResourceError::Io { .. } ) ) );
    }


    #[test]
    fn test_short_read_is_io() {
        let dir = tempfile::tempdir().unwrap();
        write_store( dir.path(), &[ ( "a", 0, &b"payload"[ .. ] ) ] );

        let mut entry = ResourceStore::load( dir.path() ).entry( "a" ).unwrap();
        entry.length += 100;
        let mut index = HashMap::new();
        index.insert( "a".to_string(), entry );
        let store = ResourceStore::with_index( dir.path(), index );

        assert!( matches!( store.resolve( "a" ), Err( ResourceError::Io { .. } ) ) );
    }


    #[test]
    fn test_oversized_length_is_io() {
        let dir = tempfile::tempdir().unwrap();
        write_store( dir.path(), &[ ( "a", 0, &b"payload"[ .. ] ) ] );

        let mut index = HashMap::new();
        index.insert( "huge".to_string(), IndexEntry { length: 1 << 46, offset: 0, shard: 0 } );
        index.insert( "past_end".to_string(), IndexEntry { length: 16, offset: u64::MAX / 2, shard: 0 } );
        let store = ResourceStore::with_index( dir.path(), index );

        match store.resolve( "huge" ) {
            Err( ResourceError::Io { source, .. } ) => {
                assert_eq!( source.kind(), std::io::ErrorKind::UnexpectedEof );
            }
            other => panic!( "unexpected result: {:?}", other.map( |d| d.len() ) ),
        }
        assert!( matches!( store.resolve( "past_end" ), Err( ResourceError::Io { .. } ) ) );
    }


    #[test]
    fn test_garbage_frame_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all( dir.path().join( "datas" ) ).unwrap();
        fs::write( dir.path().join( shard_path( 0 ) ), vec![ 0xAB; 64 ] ).unwrap();

        let mut index = HashMap::new();
        index.insert( "junk".to_string(), IndexEntry { length: 64, offset: 0, shard: 0 } );
        let store = ResourceStore::with_index( dir.path(), index );

        assert!( matches!( store.resolve( "junk" ), Err( ResourceError::CorruptData { .. } ) ) );
    }


    #[test]
    fn test_shard_path() {
        assert_eq!( shard_path( 0 ), "datas/data0.dat" );
        assert_eq!( shard_path( 12 ), "datas/data12.dat" );
    }
}
