mod helpers;
mod host;
mod lifecycle;
mod restart;
