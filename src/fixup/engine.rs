//! Fixup orchestration.
//!
//! Sequences import resolution, chain application, and slide application,
//! and enforces the per-image load-state machine. Symbol lookup, pointer
//! signing, and first-mapper arbitration are capabilities injected by the
//! embedding loader.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::dyld::slide::{apply_slide, SlideStats};
use crate::error::{Error, Result};
use crate::fixup::chain::{self, BindTarget, FixupCounts, WeakMissingSlot};
use crate::fixup::imports::{parse_imports, ImportEntry};
use crate::macho::{ImageContext, PtrAuthKey};
use crate::util::{write_u32_le_at, write_u64_le_at};

// =============================================================================
// Injected Capabilities
// =============================================================================

/// Looks up an imported symbol's address.
///
/// The engine never walks export tries itself; the embedding loader supplies
/// lookup. Returning `None` for a weak import binds the slot to zero and
/// queues it for re-patching; for a non-weak import it is a fatal
/// [`Error::UnresolvedSymbol`].
pub trait SymbolResolver: Sync {
    /// Resolves one import-table entry to an address.
    fn resolve(&self, import: &ImportEntry) -> Option<u64>;
}

/// Signs a pointer with arm64e pointer-authentication metadata.
///
/// On hardware this is the PAC instruction set; tests and non-arm64e hosts
/// use [`NullSigner`].
pub trait PointerSigner: Sync {
    /// Signs `target` for storage at `location`.
    fn sign(&self, target: u64, location: u64, diversity: u16, addr_div: bool, key: PtrAuthKey)
        -> u64;
}

/// Signer that stores pointers unsigned.
pub struct NullSigner;

impl PointerSigner for NullSigner {
    #[inline]
    fn sign(&self, target: u64, _: u64, _: u16, _: bool, _: PtrAuthKey) -> u64 {
        target
    }
}

/// Arbitration for cache slide application: only the first mapper of a
/// shared region may slide it, everyone else reuses the slid mapping.
pub trait FirstMapperClaim: Sync {
    /// Returns true exactly once, for the winning claimer.
    fn try_claim_first_mapper(&self) -> bool;
}

/// In-process claim backed by an atomic flag.
#[derive(Debug, Default)]
pub struct ProcessLocalClaim {
    claimed: AtomicBool,
}

impl ProcessLocalClaim {
    /// Creates an unclaimed flag.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirstMapperClaim for ProcessLocalClaim {
    fn try_claim_first_mapper(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Resolver backed by a symbol table; used by tests and the CLI.
#[derive(Debug, Default)]
pub struct TableResolver {
    symbols: HashMap<String, u64>,
}

impl TableResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines one symbol.
    pub fn define(&mut self, name: &str, address: u64) {
        self.symbols.insert(name.to_string(), address);
    }
}

impl SymbolResolver for TableResolver {
    fn resolve(&self, import: &ImportEntry) -> Option<u64> {
        self.symbols.get(&import.name).copied()
    }
}

// =============================================================================
// Load State
// =============================================================================

/// Lifecycle of one loaded image.
///
/// Fixups mutate words in place and a fixed-up word is indistinguishable
/// from a pristine one, so application must happen exactly once; the state
/// machine rejects a second pass instead of corrupting memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    /// Not yet mapped
    Unloaded,
    /// Mapped, chains still pristine
    Mapped,
    /// Local pointers rebased
    FixedUp,
    /// Imports bound
    Bound,
    /// Initializers have run
    Initialized,
}

impl LoadState {
    /// State name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Mapped => "mapped",
            LoadState::FixedUp => "fixed-up",
            LoadState::Bound => "bound",
            LoadState::Initialized => "initialized",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Loaded Image
// =============================================================================

/// One image moving through the load lifecycle.
pub struct LoadedImage {
    image: ImageContext,
    state: LoadState,
    slide: u64,
    imports: Vec<ImportEntry>,
    weak_missing: Vec<WeakMissingSlot>,
}

impl LoadedImage {
    /// Maps raw Mach-O bytes; the image enters the `Mapped` state.
    pub fn map(data: &[u8]) -> Result<Self> {
        Ok(Self {
            image: ImageContext::new(data)?,
            state: LoadState::Mapped,
            slide: 0,
            imports: Vec::new(),
            weak_missing: Vec::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// The underlying image.
    pub fn image(&self) -> &ImageContext {
        &self.image
    }

    /// The parsed import table (empty before fixups are applied).
    pub fn imports(&self) -> &[ImportEntry] {
        &self.imports
    }

    /// Bind slots still waiting for a weak definition.
    pub fn weak_missing(&self) -> &[WeakMissingSlot] {
        &self.weak_missing
    }

    /// Consumes the wrapper, returning the fixed-up image.
    pub fn into_image(self) -> ImageContext {
        self.image
    }

    fn require_state(&self, expected: LoadState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidLoadState {
                state: self.state.name(),
                operation,
            });
        }
        Ok(())
    }

    /// Rebases and binds every chained fixup in the image.
    ///
    /// Runs exactly once: the image must be in the `Mapped` state and ends
    /// in `Bound`. A failure mid-application leaves the image poisoned in
    /// `FixedUp`; it cannot be retried.
    pub fn apply_fixups(
        &mut self,
        slide: u64,
        resolver: &dyn SymbolResolver,
        signer: &dyn PointerSigner,
    ) -> Result<FixupCounts> {
        self.require_state(LoadState::Mapped, "apply fixups")?;

        if self.image.chained_fixups_command().is_none() {
            debug!("image has no chained fixups");
            self.state = LoadState::Bound;
            return Ok(FixupCounts::default());
        }

        let blob = self.image.chained_fixups_data()?;
        let header = chain::parse_header(blob)?;
        let imports = parse_imports(blob, &header)?;
        let targets = resolve_bind_targets(&imports, resolver)?;

        // Rebase and bind happen in the same chain pass.
        self.state = LoadState::FixedUp;
        self.slide = slide;

        let mut weak_missing = Vec::new();
        let counts = chain::apply_chains(&mut self.image, slide, &targets, signer, &mut weak_missing)?;

        info!(
            slide = format_args!("{slide:#x}"),
            rebases = counts.rebases,
            binds = counts.binds,
            weak_missing = weak_missing.len(),
            "applied chained fixups"
        );

        self.imports = imports;
        self.weak_missing = weak_missing;
        self.state = LoadState::Bound;
        Ok(counts)
    }

    /// Marks initializers as run; the terminal transition.
    pub fn mark_initialized(&mut self) -> Result<()> {
        self.require_state(LoadState::Bound, "mark initialized")?;
        self.state = LoadState::Initialized;
        Ok(())
    }

    /// Re-resolves bind slots whose weak import was missing at fixup time.
    ///
    /// Walks only the recorded slots, never the chains. Slots that resolve
    /// are patched and removed from the list; the rest stay queued. Returns
    /// the number of slots patched.
    pub fn repatch_missing_weak(
        &mut self,
        resolver: &dyn SymbolResolver,
        signer: &dyn PointerSigner,
    ) -> Result<usize> {
        if self.state < LoadState::Bound {
            return Err(Error::InvalidLoadState {
                state: self.state.name(),
                operation: "repatch weak imports",
            });
        }

        let base = self.image.preferred_load_address().wrapping_add(self.slide);
        let slots = std::mem::take(&mut self.weak_missing);
        let mut patched = 0;

        for slot in slots {
            let import = self
                .imports
                .get(slot.ordinal as usize)
                .ok_or_else(|| {
                    Error::out_of_range_ordinal(slot.ordinal, self.imports.len() as u32)
                })?;

            let Some(address) = resolver.resolve(import) else {
                self.weak_missing.push(slot);
                continue;
            };

            let value = match slot.auth {
                Some(auth) => signer.sign(
                    address,
                    base + slot.vm_offset,
                    auth.diversity,
                    auth.addr_div,
                    auth.key,
                ),
                None => address
                    .wrapping_add(import.addend as u64)
                    .wrapping_add(slot.addend as u64),
            };

            match slot.format.word_size() {
                4 => write_u32_le_at(self.image.as_bytes_mut(), slot.file_offset, value as u32),
                _ => write_u64_le_at(self.image.as_bytes_mut(), slot.file_offset, value),
            }
            debug!(
                ordinal = slot.ordinal,
                symbol = %import.name,
                "re-patched weak import"
            );
            patched += 1;
        }

        Ok(patched)
    }
}

/// Resolves the import table into bind targets in ordinal order.
///
/// Import-table addends are folded into the target address here; inline
/// chain addends are added on top at apply time. A missing weak import
/// becomes a zero target flagged for re-patching.
pub fn resolve_bind_targets(
    imports: &[ImportEntry],
    resolver: &dyn SymbolResolver,
) -> Result<Vec<BindTarget>> {
    let mut targets = Vec::with_capacity(imports.len());
    for import in imports {
        match resolver.resolve(import) {
            Some(address) => targets.push(BindTarget {
                address: address.wrapping_add(import.addend as u64),
                weak_missing: false,
            }),
            None if import.weak_import => {
                warn!(
                    symbol = %import.name,
                    lib = %import.lib_description(),
                    "weak import missing, binding to zero"
                );
                targets.push(BindTarget {
                    address: 0,
                    weak_missing: true,
                });
            }
            None => {
                return Err(Error::UnresolvedSymbol {
                    ordinal: import.ordinal,
                    name: import.name.clone(),
                })
            }
        }
    }
    Ok(targets)
}

/// Applies chained fixups to a mapped image: the whole-image entry point.
pub fn apply_image_fixups(
    loaded: &mut LoadedImage,
    slide: u64,
    resolver: &dyn SymbolResolver,
    signer: &dyn PointerSigner,
) -> Result<FixupCounts> {
    loaded.apply_fixups(slide, resolver, signer)
}

/// Slides a shared-cache data mapping, arbitrated through `claim`.
///
/// Only the winning first mapper applies the slide; losers get `Ok(None)`
/// and must reuse the existing slid mapping. A slide failure is fatal for
/// the whole process, not just one image.
pub fn apply_cache_slide(
    mapping: &mut [u8],
    mapping_addr: u64,
    slide_info: &[u8],
    slide: u64,
    signer: &dyn PointerSigner,
    claim: &dyn FirstMapperClaim,
) -> Result<Option<SlideStats>> {
    if !claim.try_claim_first_mapper() {
        info!("cache mapping already slid by another mapper");
        return Ok(None);
    }
    let stats = apply_slide(mapping, mapping_addr, slide_info, slide, signer)?;
    Ok(Some(stats))
}
