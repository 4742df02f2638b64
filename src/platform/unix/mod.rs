mod fd;
pub(crate) use self::fd::Fd;
mod interrupt;
pub(crate) use interrupt::InterruptEvent;
mod tun;
pub(crate) use self::tun::Tun;
