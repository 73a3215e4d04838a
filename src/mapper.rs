//! A `PageProvider` is responsible for acquiring address space and backing
//! memory from the operating system on behalf of zones and big allocations.
//! Both [`crate::zone::Zone`] and [`crate::big_zone`] are generic over a
//! page provider purely so tests can substitute a tracked fake; production
//! code always uses [`DefaultPageProvider`].
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")
))]
use disabled_contracts::*;

use std::ptr::NonNull;

use nix::sys::mman::ProtFlags;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_arange_map;

use crate::error::MapError;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait PageProvider: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this provider. All calls into the
    /// provider align addresses and sizes to that page size.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Reserves and backs a fresh anonymous, zeroed, read-write mapping of
    /// `size` bytes. If `populate` is set, the provider should ask the
    /// kernel to fault the whole range in up front rather than lazily.
    #[requires(size > 0 && size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> debug_arange_map::reserve_range(ret.as_ref().unwrap().as_ptr() as usize, size).is_ok())]
    fn map_rw(&self, size: usize, populate: bool) -> Result<NonNull<u8>, MapError>;

    /// Reserves `size` bytes of address space with no access permissions,
    /// without necessarily backing them with memory.
    #[requires(size > 0 && size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> debug_arange_map::reserve_range(ret.as_ref().unwrap().as_ptr() as usize, size).is_ok())]
    fn map_none(&self, size: usize) -> Result<NonNull<u8>, MapError>;

    /// Switches a single page starting at `addr` to no-access.
    #[requires(addr.as_ptr() as usize % self.page_size() == 0)]
    fn guard(&self, addr: NonNull<u8>) -> Result<(), MapError>;

    /// Changes the protection of `[addr, addr + size)`.
    #[requires(addr.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn protect(&self, addr: NonNull<u8>, size: usize, prot: ProtFlags) -> Result<(), MapError>;

    /// Releases `[addr, addr + size)` back to the kernel entirely. Must be a
    /// subset of a single previous `map_rw`/`map_none` call.
    #[requires(addr.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> debug_arange_map::release_range(addr.as_ptr() as usize, size).is_ok())]
    fn unmap(&self, addr: NonNull<u8>, size: usize) -> Result<(), MapError>;

    /// Advises the kernel that `[addr, addr + size)` may be discarded and
    /// demand-faulted back in zeroed on next touch, without releasing the
    /// address space itself. Used to let the allocator reuse a big
    /// allocation's backing pages without giving up the mapping.
    #[requires(addr.as_ptr() as usize % self.page_size() == 0)]
    fn advise_dontneed(&self, addr: NonNull<u8>, size: usize) -> Result<(), MapError>;
}

#[derive(Debug)]
pub struct DefaultPageProvider {}

#[contract_trait]
impl PageProvider for DefaultPageProvider {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn map_rw(&self, size: usize, populate: bool) -> Result<NonNull<u8>, MapError> {
        crate::map::map_rw(size, populate)
    }

    fn map_none(&self, size: usize) -> Result<NonNull<u8>, MapError> {
        crate::map::map_none(size)
    }

    fn guard(&self, addr: NonNull<u8>) -> Result<(), MapError> {
        crate::map::guard(addr)
    }

    fn protect(&self, addr: NonNull<u8>, size: usize, prot: ProtFlags) -> Result<(), MapError> {
        crate::map::protect(addr, size, prot)
    }

    fn unmap(&self, addr: NonNull<u8>, size: usize) -> Result<(), MapError> {
        crate::map::unmap(addr, size)
    }

    fn advise_dontneed(&self, addr: NonNull<u8>, size: usize) -> Result<(), MapError> {
        crate::map::advise_dontneed(addr, size)
    }
}

/// The default, production page provider. A single static instance is
/// shared by every zone and the big-zone path.
pub static DEFAULT_PAGE_PROVIDER: DefaultPageProvider = DefaultPageProvider {};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_provider_page_size_is_sane() {
        let provider = DefaultPageProvider {};
        let page_size = provider.page_size();
        assert!(page_size > 0);
        assert_eq!(page_size & (page_size - 1), 0);
    }

    #[test]
    fn default_provider_round_trips_a_mapping() {
        let provider = DefaultPageProvider {};
        let size = provider.page_size();

        let region = provider.map_rw(size, false).expect("map_rw should succeed");
        unsafe {
            std::ptr::write_bytes(region.as_ptr(), 0x7, size);
            assert_eq!(*region.as_ptr(), 0x7);
        }

        provider.unmap(region, size).expect("unmap should succeed");
    }
}
