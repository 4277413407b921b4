// Integration tests run against real `/bin/sh` consoles.
mod console;
mod programs;
mod relaunch;
