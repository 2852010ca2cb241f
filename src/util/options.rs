use crate::util::constants::MAX_BUFFER_SIZE;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Runtime options. Every option can be set through the builder before the runtime is
        /// created, or through a `G1_<NAME>` environment variable (e.g. `G1_UPDATE_BUFFER_SIZE=512`).
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option by its snake case name. Returns false, and keeps the old value,
            /// if the name is unknown, the value cannot be parsed, or the value is invalid.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_option()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            /// The same as [`Options::default`] but without reading environment variables.
            pub fn without_env() -> Self {
                Options {
                    $($name: $default),*
                }
            }

            /// Override options with `G1_`-prefixed environment variables.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "G1_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Self::without_env();
                options.read_env_var_settings();
                options
            }
        }
    ]
}

options! {
    /// Number of concurrent refinement threads. Zero disables background refinement,
    /// leaving mutators to refine once the red zone is reached.
    conc_refinement_threads:                  usize [always_valid] = num_cpus::get(),
    /// Number of parallel GC threads. Used to derive the default green zone.
    parallel_gc_threads:                      usize [|v: &usize| *v > 0] = num_cpus::get(),
    /// Capacity, in cards, of each dirty card log buffer.
    update_buffer_size:                       usize [|v: &usize| *v > 0 && *v <= MAX_BUFFER_SIZE] = 256,
    /// Capacity, in entries, of each SATB log buffer.
    satb_buffer_size:                         usize [|v: &usize| *v > 0 && *v <= MAX_BUFFER_SIZE] = 1024,
    /// Initial green zone in buffers. Zero derives it from `parallel_gc_threads`.
    conc_refinement_green_zone:               usize [always_valid] = 0,
    /// Initial yellow zone in buffers. Zero derives it from the green zone.
    conc_refinement_yellow_zone:              usize [always_valid] = 0,
    /// Initial red zone in buffers. Zero derives it from the yellow zone.
    conc_refinement_red_zone:                 usize [always_valid] = 0,
    /// Buffers between the activation thresholds of successive refinement threads.
    conc_refinement_threshold_step:           usize [|v: &usize| *v > 0] = 2,
    /// Recompute the zones from pause timings in `adjust`.
    use_adaptive_conc_refinement:             bool  [always_valid] = true,
    /// Green zone growth factor when update-RS time is under its goal.
    conc_refinement_inc_factor:               f64   [|v: &f64| *v > 1.0] = 1.1,
    /// Green zone shrink factor when update-RS time exceeds its goal.
    conc_refinement_dec_factor:               f64   [|v: &f64| *v > 0.0 && *v < 1.0] = 0.9,
    /// Pause time goal in milliseconds.
    max_gc_pause_millis:                      usize [|v: &usize| *v > 0] = 200,
    /// Share of the pause goal, in percent, budgeted for scanning logged cards.
    rset_updating_pause_time_percent:         usize [|v: &usize| *v <= 100] = 10,
    /// Number of completed SATB buffers that triggers concurrent processing.
    satb_process_completed_threshold:         usize [always_valid] = 20,
    /// A filtered SATB buffer is handed off only if less than this percentage of it is free.
    satb_buffer_enqueueing_threshold_percent: usize [|v: &usize| *v <= 100] = 60,
    /// log2 of the number of entries in the hot card cache. Zero disables the cache.
    conc_rs_log_cache_size:                   usize [|v: &usize| *v <= 27] = 10,
    /// Number of refinements after which a card is considered hot.
    conc_rs_hot_card_limit:                   u8    [|v: &u8| *v > 0] = 4,
}

impl Options {
    /// Set options in bulk from a string of whitespace separated `key=value` pairs.
    /// Returns false if any pair is malformed or rejected. Valid pairs are still applied.
    pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
        let mut all_ok = true;
        for opt in options.split_ascii_whitespace() {
            let kv: Vec<&str> = opt.splitn(2, '=').collect();
            if kv.len() != 2 {
                warn!("Malformed option {:?}, expected key=value", opt);
                all_ok = false;
                continue;
            }
            all_ok &= self.set_from_str(kv[0], kv[1]);
        }
        all_ok
    }

    /// The pause-time budget, in milliseconds, for scanning logged cards.
    pub fn logged_cards_scan_goal_ms(&self) -> f64 {
        self.max_gc_pause_millis as f64 * self.rset_updating_pause_time_percent as f64 / 100.0
    }

    /// Convert a zone option expressed in buffers into cards.
    ///
    /// Overflow is a configuration error and is fatal.
    pub fn buffers_to_cards(&self, buffers: usize, name: &str) -> usize {
        match buffers.checked_mul(self.update_buffer_size) {
            Some(cards) => cards,
            None => {
                error!(
                    "{} ({}) * update_buffer_size ({}) overflows",
                    name, buffers, self.update_buffer_size
                );
                panic!("Invalid refinement zone configuration: {} is too large", name);
            }
        }
    }
}
