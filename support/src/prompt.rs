/*
 * This file is part of KAFS.
 *
 * KAFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * KAFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * KAFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! This module implements interactive confirmation prompts for CLI tools.

use libc::ECHO;
use libc::ECHOE;
use libc::ICANON;
use libc::STDIN_FILENO;
use libc::TCSANOW;
use libc::VMIN;
use libc::tcgetattr;
use libc::tcsetattr;
use libc::termios;
use std::io::BufRead;
use std::io::Write;
use std::mem::MaybeUninit;
use std::{fmt, io};

/// Shows a prompt. Returns when a newline is received, or `None` on EOF.
///
/// Arguments:
/// - `prompt` is the prompt's text.
/// - `hidden` tells whether the input should be hidden (used for passwords).
pub fn prompt<P: fmt::Display>(prompt: P, hidden: bool) -> Option<String> {
    // Save termios state
    let saved_termios = unsafe {
        let mut t: termios = MaybeUninit::zeroed().assume_init();
        tcgetattr(STDIN_FILENO, &mut t);
        t
    };
    if hidden {
        let mut termios = saved_termios;
        termios.c_lflag &= !(ICANON | ECHO | ECHOE);
        termios.c_cc[VMIN] = 1;
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &termios);
        }
    }
    print!("{prompt}");
    let _ = io::stdout().flush();
    let input = io::stdin().lock().lines().next()?.unwrap_or_default();
    if hidden {
        println!();
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &saved_termios);
        }
    }
    Some(input)
}

/// Shows a yes/no confirmation prompt, defaulting to "no" on empty input.
pub fn confirm<P: fmt::Display>(prompt_text: P) -> bool {
    prompt(prompt_text, false)
        .map(|s| s.eq_ignore_ascii_case("y") || s.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}
