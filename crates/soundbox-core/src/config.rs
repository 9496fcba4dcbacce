//! Player configuration
//!
//! Serializable so hosts can persist it next to their own settings.

use std::time::Duration;

use serde::{ Deserialize, Serialize };


/// Level the decibel curve reaches on its second-to-last step.
pub const DECIBEL_FLOOR: f32 = -60.0;


/// Shape of the gain schedule used when a sound is stopped.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize )]
#[serde( rename_all = "lowercase" )]
pub enum FadeCurve {
    /// Equal linear decrements
    #[default]
    Linear,
    /// Equal decibel decrements
    Decibel,
}


/// Fade-out applied by an explicit stop.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct FadeConfig {
    /// Total fade length in milliseconds
    pub duration_ms: u64,

    /// Number of discrete gain steps
    pub steps: u32,

    pub curve: FadeCurve,
}


impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            duration_ms: 1500,
            steps: 30,
            curve: FadeCurve::Linear,
        }
    }
}


impl FadeConfig {
    pub fn duration( &self ) -> Duration {
        Duration::from_millis( self.duration_ms )
    }


    /// Sleep between two gain steps.
    pub fn step_interval( &self ) -> Duration {
        self.duration() / self.steps.max( 1 )
    }


    /// Gain after each step, starting from `start`.
    ///
    /// The schedule is non-increasing, never negative and its last entry is
    /// exactly zero.
    pub fn schedule( &self, start: f32 ) -> Vec<f32> {
        let steps = self.steps.max( 1 );
        let start = if start.is_finite() { start.max( 0.0 ) } else { 0.0 };
        let decrement = start / steps as f32;

        ( 1..=steps )
            .map( |i| {
                if i == steps {
                    return 0.0;
                }
                match self.curve {
                    FadeCurve::Linear => ( start - decrement * i as f32 ).max( 0.0 ),
                    FadeCurve::Decibel => {
                        let db = DECIBEL_FLOOR * i as f32 / ( steps - 1 ) as f32;
                        start * 10f32.powf( db / 20.0 )
                    }
                }
            })
            .collect()
    }
}


/// Configuration for a `Player`.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct PlayerConfig {
    pub fade: FadeConfig,

    /// Output buffer length in milliseconds
    pub buffer_ms: u64,

    /// Resample streams whose rate differs from the device rate.
    /// When off, such streams play at the wrong pitch and speed.
    pub resample: bool,
}


impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            fade: FadeConfig::default(),
            buffer_ms: 100,
            resample: true,
        }
    }
}


impl PlayerConfig {
    /// Output buffer length in frames at `sample_rate`.
    pub fn buffer_frames( &self, sample_rate: u32 ) -> usize {
        ( sample_rate as u64 * self.buffer_ms / 1000 ).max( 1 ) as usize
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn assert_fade_shape( schedule: &[f32], start: f32 ) {
        assert!( schedule[ 0 ] <= start );
        for pair in schedule.windows( 2 ) {
            assert!( pair[ 1 ] <= pair[ 0 ], "schedule increased: {:?}", pair );
        }
        assert!( schedule.iter().all( |g| *g >= 0.0 ) );
        assert_eq!( *schedule.last().unwrap(), 0.0 );
    }


    #[test]
    fn test_linear_schedule() {
        let fade = FadeConfig { duration_ms: 1000, steps: 4, curve: FadeCurve::Linear };
        let schedule = fade.schedule( 1.0 );
        assert_eq!( schedule, vec![ 0.75, 0.5, 0.25, 0.0 ] );
    }


    #[test]
    fn test_decibel_schedule() {
        let fade = FadeConfig { duration_ms: 1000, steps: 40, curve: FadeCurve::Decibel };
        let schedule = fade.schedule( 0.8 );
        assert_eq!( schedule.len(), 40 );
        assert_fade_shape( &schedule, 0.8 );
        // Second-to-last step sits on the floor
        assert!( ( schedule[ 38 ] - 0.8 * 0.001 ).abs() < 1e-5 );
    }


    #[test]
    fn test_schedule_from_any_start() {
        for curve in [ FadeCurve::Linear, FadeCurve::Decibel ] {
            for start in [ 0.0, 0.3, 1.0, 1.5 ] {
                let fade = FadeConfig { duration_ms: 1500, steps: 30, curve };
                assert_fade_shape( &fade.schedule( start ), start );
            }
        }
    }


    #[test]
    fn test_schedule_bad_start() {
        let fade = FadeConfig::default();
        assert!( fade.schedule( -1.0 ).iter().all( |g| *g == 0.0 ) );
        assert!( fade.schedule( f32::NAN ).iter().all( |g| *g == 0.0 ) );
    }


    #[test]
    fn test_zero_steps_is_one_step() {
        let fade = FadeConfig { duration_ms: 300, steps: 0, curve: FadeCurve::Linear };
        assert_eq!( fade.schedule( 1.0 ), vec![ 0.0 ] );
        assert_eq!( fade.step_interval(), Duration::from_millis( 300 ) );
    }


    #[test]
    fn test_step_interval() {
        let fade = FadeConfig::default();
        assert_eq!( fade.step_interval(), Duration::from_millis( 50 ) );
    }


    #[test]
    fn test_buffer_frames() {
        let config = PlayerConfig::default();
        assert_eq!( config.buffer_frames( 44100 ), 4410 );
    }


    #[test]
    fn test_config_partial_json() {
        let config: PlayerConfig =
            serde_json::from_str( r#"{ "fade": { "steps": 60, "curve": "decibel" } }"# ).unwrap();
        assert_eq!( config.fade.steps, 60 );
        assert_eq!( config.fade.curve, FadeCurve::Decibel );
        assert_eq!( config.fade.duration_ms, 1500 );
        assert!( config.resample );
    }
}
