//! Soundbox CLI - Play packed sound resources and files

mod cli;
mod settings;

use std::future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ bail, Context, Result };
use clap::Parser;

use cli::Args;
use settings::Settings;
use soundbox_core::{ CpalDevice, HeadlessDevice, OutputDevice, PlaybackHandle, Player, ResourceStore };


/// How often to check whether every sound has finished.
const POLL_INTERVAL: Duration = Duration::from_millis( 50 );


/// Prints every resource key with its location.
fn list_resources( store: &ResourceStore ) {
    if store.is_empty() {
        println!( "No resources under {}", store.root().display() );
        return;
    }

    for key in store.keys() {
        if let Some( entry ) = store.entry( key ) {
            println!( "{:<40} shard {:>3}  offset {:>10}  {:>8} bytes", key, entry.shard, entry.offset, entry.length );
        }
    }
}


/// Starts one target: an existing file, or else a resource key.
fn start_target( player: &Player, target: &str, looping: bool ) -> Result<PlaybackHandle> {
    let path = Path::new( target );
    let handle = if path.is_file() {
        player.play_file( path, looping )
    } else if looping {
        player.play_key_looped( target )
    } else {
        player.play_key( target )
    };

    handle.with_context( || format!( "Failed to play {}", target ) )
}


/// Resolves once every session has been reclaimed.
async fn all_finished( player: &Player ) {
    while player.active_count() > 0 {
        tokio::time::sleep( POLL_INTERVAL ).await;
    }
}


/// Resolves after `secs` seconds, or never.
async fn stop_timer( secs: Option<f64> ) {
    match secs {
        Some( secs ) => tokio::time::sleep( Duration::from_secs_f64( secs.max( 0.0 ) ) ).await,
        None => future::pending().await,
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level( args.log_level() )
        .with_target( true )
        .with_writer( std::io::stderr )
        .init();

    let mut settings = Settings::load();
    if let Some( ref root ) = args.root {
        settings.root = root.clone();
    }
    if let Some( fade_ms ) = args.fade_ms {
        settings.player.fade.duration_ms = fade_ms;
    }
    if args.save {
        settings.save();
    }

    let resources = ResourceStore::load( &settings.root );
    if args.list {
        list_resources( &resources );
        return Ok(());
    }

    if args.targets.is_empty() {
        bail!( "Nothing to play; pass files or resource keys (see --help)" );
    }

    let device: Arc<dyn OutputDevice> = if args.headless {
        Arc::new( HeadlessDevice::new() )
    } else {
        Arc::new( CpalDevice::new() )
    };
    let player = Player::new( device, resources, settings.player.clone() );

    let mut started = 0;
    for target in &args.targets {
        match start_target( &player, target, args.looping ) {
            Ok( handle ) => {
                tracing::info!( "{} → {}", target, handle );
                started += 1;
            }
            Err( e ) => eprintln!( "{:#}", e ),
        }
    }

    if started == 0 {
        bail!( "No target could be played" );
    }

    if args.looping && args.stop_after.is_none() {
        eprintln!( "Looping; press Ctrl-C to stop" );
    }

    tokio::select! {
        _ = all_finished( &player ) => {
            tracing::info!( "All sounds finished" );
        }
        _ = stop_timer( args.stop_after ) => {
            tracing::info!( "Stop time reached" );
        }
        result = tokio::signal::ctrl_c() => {
            result.context( "Failed to listen for Ctrl-C" )?;
            tracing::info!( "Interrupted" );
        }
    }

    let fades = player.stop_all();
    tokio::task::spawn_blocking( move || {
        for fade in fades {
            fade.wait();
        }
    })
    .await
    .context( "Fade-out task failed" )?;

    Ok(())
}
