//! x86/x86-64-guest, AArch64-host dynamic binary translator core.
//!
//! Covers the three in-scope subsystems (spec §1/§2): the opcode
//! dictionary and decoder, the multi-block frontend that discovers
//! translation units, the translation cache coordinator, and the async
//! object-cache service that persists compiled code across runs. The host
//! code generator itself is out of scope — this crate stops at
//! [`emitter::HostCodeConsumer`], the trait boundary a real AArch64
//! emitter implements to consume decoded blocks and register the
//! resulting host code with [`cache::TranslationCache`].

pub mod cache;
pub mod config;
pub mod decode;
pub mod emitter;
pub mod error;
pub mod frontend;
pub mod objcache;
pub mod opcode;

use crate::cache::{GuestIp, HostCode, TranslationCache};
use crate::config::{Config, ObjectCacheMode};
use crate::emitter::HostCodeConsumer;
use crate::frontend::{BlockInfo, MultiBlockFrontend, PageObserver, SymbolRange};
use crate::objcache::AsyncObjectCacheService;

/// Composition root wiring the decoder/frontend, translation cache, and
/// async object-cache service together (spec §2 control flow: "emitter
/// requests compile(guest_ip) -> TCC checks cache -> miss -> MB runs DEC
/// to produce a BlockInfo -> emitter consumes it -> resulting host code
/// registered with TCC -> AOCS enqueues a serialize job asynchronously").
///
/// Does not itself produce host code — that is the emitter's job, reached
/// only through [`HostCodeConsumer`]. Owns everything that is in scope:
/// decoding, multi-block discovery, the cache coordinator, and (when
/// configured) the persistent object cache.
pub struct Translator {
    frontend: MultiBlockFrontend,
    cache: TranslationCache,
    objcache: Option<AsyncObjectCacheService>,
    info: BlockInfo,
}

impl Translator {
    pub fn new(cfg: Config) -> Self {
        let objcache = match cfg.object_cache {
            ObjectCacheMode::None => None,
            _ => Some(AsyncObjectCacheService::start(cfg.clone())),
        };
        Translator {
            frontend: MultiBlockFrontend::new(cfg),
            cache: TranslationCache::new(),
            objcache,
            info: BlockInfo::default(),
        }
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn object_cache(&self) -> Option<&AsyncObjectCacheService> {
        self.objcache.as_ref()
    }

    /// `compile(thread, guest_ip)` (spec §2 control flow).
    ///
    /// Returns a cache hit immediately. On a miss, consults the object
    /// cache before falling back to the multi-block frontend, which walks
    /// `fetch` starting at `guest_ip` and hands every discovered block to
    /// `consumer` — expected to emit host code and [`TranslationCache::install`]
    /// it before this call returns. Returns `None` if another thread is
    /// already compiling this exact `(thread, guest_ip)` fingerprint (spec
    /// §8: at most one concurrent compile per fingerprint); the caller is
    /// expected to retry rather than spin here.
    pub fn compile(
        &mut self,
        thread: u64,
        guest_ip: GuestIp,
        fetch: impl Fn(u64) -> Option<&'static [u8]>,
        symbol_range: SymbolRange,
        mut consumer: impl HostCodeConsumer,
        notify_page: impl PageObserver,
    ) -> Option<HostCode> {
        if let Some(hit) = self.cache.lookup(thread, guest_ip) {
            return Some(hit);
        }

        if let Some(objcache) = &self.objcache {
            if let Some(section) = objcache.fetch_code_object_from_cache(guest_ip) {
                // The section's backing Arc is kept alive indefinitely by
                // the region's own copy in `objcache`; a real (out of
                // scope) emitter would copy these bytes into its own
                // executable mapping immediately rather than hold this
                // pointer across calls.
                let host_code =
                    HostCode::new(section.host_code.as_ptr() as usize, section.host_code.len());
                self.cache
                    .install(thread, guest_ip, section.host_code.len() as u64, host_code);
                return Some(host_code);
            }
        }

        if !self.cache.begin_compile((thread, guest_ip)) {
            return None;
        }

        self.frontend.decode_at_entry(
            &mut self.info,
            fetch,
            guest_ip,
            0,
            symbol_range,
            notify_page,
        );

        for block in &self.info.blocks {
            consumer.consume_block(block, &self.info.pool[block.range()]);
        }

        self.cache.end_compile((thread, guest_ip));
        self.cache.lookup(thread, guest_ip)
    }

    /// Invalidates every translation overlapping `[start, start+length)` on
    /// `thread`, forwarding to [`TranslationCache::invalidate_range`] (spec
    /// §4.2 SMC handling).
    pub fn invalidate_range(&self, thread: u64, start: GuestIp, length: u64, callback: impl FnMut(GuestIp)) {
        self.cache.invalidate_range(thread, start, length, callback);
    }

    pub fn shutdown(&self) {
        if let Some(objcache) = &self.objcache {
            objcache.shutdown();
        }
    }
}

impl Drop for Translator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodedInst;
    use crate::frontend::DecodedBlocks;

    struct RecordingConsumer {
        blocks_seen: usize,
    }

    impl HostCodeConsumer for RecordingConsumer {
        fn consume_block(&mut self, _block: &DecodedBlocks, _insts: &[DecodedInst]) {
            self.blocks_seen += 1;
        }
    }

    fn fetch_over(base: u64, bytes: &'static [u8]) -> impl Fn(u64) -> Option<&'static [u8]> {
        move |addr: u64| {
            if addr < base {
                return None;
            }
            let off = (addr - base) as usize;
            if off >= bytes.len() {
                None
            } else {
                Some(&bytes[off..])
            }
        }
    }

    #[test]
    fn compile_then_cache_hit_skips_frontend() {
        let mut translator = Translator::new(Config::default());
        static BYTES: [u8; 4] = [0x48, 0x89, 0xE5, 0xC3]; // mov rbp,rsp; ret
        let mut consumer = RecordingConsumer { blocks_seen: 0 };

        let result = translator.compile(
            1,
            0x400000,
            fetch_over(0x400000, &BYTES),
            SymbolRange { min: 0, max: u64::MAX },
            &mut consumer,
            |_, _, _| {},
        );
        assert!(result.is_none()); // no emitter registered anything with the TCC yet
        assert_eq!(consumer.blocks_seen, 1);

        translator
            .cache()
            .install(1, 0x400000, 4, HostCode::new(0xdead_beef, 8));
        let hit = translator.compile(
            1,
            0x400000,
            fetch_over(0x400000, &BYTES),
            SymbolRange { min: 0, max: u64::MAX },
            &mut consumer,
            |_, _, _| {},
        );
        assert_eq!(hit, Some(HostCode::new(0xdead_beef, 8)));
        assert_eq!(consumer.blocks_seen, 1); // second call never reached the frontend
    }
}
