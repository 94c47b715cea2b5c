//! Serial-port transport: a tty opened non-blocking and switched to raw mode.

use crate::error::Result;
use nix::fcntl::OFlag;
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, SetArg,
    SpecialCharacterIndices,
};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub path: PathBuf,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

impl SerialConfig {
    pub fn new(path: impl Into<PathBuf>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            data_bits: default_data_bits(),
            parity: Parity::None,
        }
    }

    fn baud_rate(&self) -> io::Result<BaudRate> {
        Ok(match self.baud {
            2400 => BaudRate::B2400,
            4800 => BaudRate::B4800,
            9600 => BaudRate::B9600,
            19200 => BaudRate::B19200,
            38400 => BaudRate::B38400,
            57600 => BaudRate::B57600,
            115_200 => BaudRate::B115200,
            other => return Err(invalid(format!("unsupported baud rate {other}"))),
        })
    }

    fn char_size(&self) -> io::Result<ControlFlags> {
        match self.data_bits {
            7 => Ok(ControlFlags::CS7),
            8 => Ok(ControlFlags::CS8),
            other => Err(invalid(format!("unsupported data bits {other}"))),
        }
    }
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, reason)
}

/// Raw tty registered with the reactor.
pub struct SerialLink {
    fd: AsyncFd<File>,
}

impl SerialLink {
    /// Open and configure the port. Must run inside a tokio runtime.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let baud = config.baud_rate()?;
        let char_size = config.char_size()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(&config.path)?;

        let fd = file.as_raw_fd();
        let mut termios = tcgetattr(fd)?;
        cfmakeraw(&mut termios);
        cfsetspeed(&mut termios, baud)?;
        termios.control_flags &=
            !(ControlFlags::CSIZE | ControlFlags::PARENB | ControlFlags::PARODD);
        termios.control_flags |= char_size | ControlFlags::CLOCAL | ControlFlags::CREAD;
        match config.parity {
            Parity::None => {}
            Parity::Odd => termios.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD,
            Parity::Even => termios.control_flags |= ControlFlags::PARENB,
        }
        termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(fd, SetArg::TCSANOW, &termios)?;

        info!(
            "opened serial port {} at {} baud",
            config.path.display(),
            config.baud
        );
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for SerialLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
