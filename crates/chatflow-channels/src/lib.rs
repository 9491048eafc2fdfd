pub mod console;
pub mod dispatch;
pub mod sink;
pub mod util;

pub use console::ConsoleAdapter;
pub use dispatch::ChannelDispatcher;
pub use sink::AdapterSink;
