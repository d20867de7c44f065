mod images;
mod notifications;
mod resolve;
mod utils;
